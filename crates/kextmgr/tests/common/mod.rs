//! Shared fixtures for manager integration tests
//!
//! Builders for kexts with and without dependencies, plus fake
//! implementations of the external collaborators: the running kernel, the
//! link/load driver, the kernel catalog, and the authenticator.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

use kextmgr::{
    Authenticator, CatalogVerb, DependencyGraph, DriverRequest, Error, Kext, KextHandle,
    KextInfo, KextManager, LibraryRequirement, LinkLoadDriver, LoadedKernel, LoadedModule,
    KernelCatalog, Result, VersionNumber,
};

pub fn version(s: &str) -> VersionNumber {
    s.parse().unwrap()
}

/// Opt-in log output while debugging a failing test run
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A kext with no dependencies
pub fn plain_kext(id: &str, vers: &str, path: &str) -> Kext {
    Kext::new(KextInfo::new(id, version(vers)), path)
}

/// A library kext others can link against (compatible back to `floor`)
pub fn library_kext(id: &str, vers: &str, floor: &str, path: &str) -> Kext {
    let mut info = KextInfo::new(id, version(vers));
    info.compatible_version = Some(version(floor));
    Kext::new(info, path)
}

/// A kext declaring library requirements
pub fn dependent_kext(id: &str, vers: &str, libs: &[(&str, &str)], path: &str) -> Kext {
    let mut info = KextInfo::new(id, version(vers));
    info.libraries = libs
        .iter()
        .map(|(lib, v)| LibraryRequirement {
            identifier: lib.to_string(),
            version: version(v),
        })
        .collect();
    Kext::new(info, path)
}

/// Manager with one registered repository
pub fn manager_with_repo(directory: &str) -> (KextManager, usize) {
    let mut manager = KextManager::new();
    let repo = manager.add_repository(Path::new(directory), true).unwrap();
    (manager, repo)
}

/// Versions of an identifier's bundles in index order, as strings
pub fn versions_of(manager: &mut KextManager, identifier: &str) -> Vec<String> {
    manager
        .copy_kexts_with_identifier(identifier)
        .iter()
        .filter_map(|h| manager.kext(*h))
        .map(|k| k.version().to_string())
        .collect()
}

/// Version of the head bundle for an identifier
pub fn head_version(manager: &mut KextManager, identifier: &str) -> Option<String> {
    let head = manager.get_kext_with_identifier(identifier)?;
    manager.kext(head).map(|k| k.version().to_string())
}

/// A fixed loaded-module list standing in for the running kernel
pub struct FakeKernel(pub Vec<LoadedModule>);

impl FakeKernel {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn with_module(name: &str, vers: &str) -> Self {
        Self(vec![LoadedModule {
            name: name.to_string(),
            version: vers.to_string(),
            address: 0x1000_0000,
            has_next: false,
        }])
    }
}

impl LoadedKernel for FakeKernel {
    fn loaded_modules(&self) -> Result<Vec<LoadedModule>> {
        Ok(self.0.clone())
    }
}

/// A link/load driver that records what it was asked to load
pub struct FakeDriver {
    pub result: Result<()>,
    pub child_exit_code: Option<i32>,
    pub loads: Vec<Vec<String>>,
}

impl FakeDriver {
    pub fn succeeding() -> Self {
        Self {
            result: Ok(()),
            child_exit_code: None,
            loads: Vec::new(),
        }
    }

    pub fn failing(err: Error) -> Self {
        Self {
            result: Err(err),
            child_exit_code: None,
            loads: Vec::new(),
        }
    }

    /// A driver that only runs out of process, exiting with the given code
    pub fn forked(exit_code: i32) -> Self {
        Self {
            result: Ok(()),
            child_exit_code: Some(exit_code),
            loads: Vec::new(),
        }
    }
}

impl LinkLoadDriver for FakeDriver {
    fn load(&mut self, graph: &DependencyGraph, _request: &DriverRequest) -> Result<()> {
        self.loads.push(
            graph
                .entries
                .iter()
                .map(|e| e.identifier.clone())
                .collect(),
        );
        self.result.clone()
    }

    fn child_command(&self, _graph: &DependencyGraph, _request: &DriverRequest) -> Option<Command> {
        let code = self.child_exit_code?;
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(format!("exit {code}"));
        Some(command)
    }
}

/// Records every plist buffer handed to the catalog
#[derive(Default)]
pub struct FakeCatalog {
    pub sent: Vec<(CatalogVerb, plist::Value)>,
}

impl KernelCatalog for FakeCatalog {
    fn send(&mut self, verb: CatalogVerb, data: &[u8]) -> Result<()> {
        let value = plist::Value::from_reader_xml(data).map_err(|_| Error::Serialization)?;
        self.sent.push((verb, value));
        Ok(())
    }
}

/// Fails authentication for a fixed set of identifiers
pub struct DenyingAuthenticator {
    deny: HashSet<String>,
}

impl DenyingAuthenticator {
    pub fn denying(identifiers: &[&str]) -> Self {
        Self {
            deny: identifiers.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Authenticator for DenyingAuthenticator {
    fn authenticate(&self, kext: &Kext, _strict: bool) -> Result<()> {
        if self.deny.contains(kext.identifier()) {
            Err(Error::authentication(kext.identifier()))
        } else {
            Ok(())
        }
    }
}

/// Handles of all missing-dependency diagnostics as identifier/version pairs
pub fn missing_deps_of(manager: &KextManager) -> Vec<(String, String)> {
    manager
        .kexts_with_missing_dependencies()
        .iter()
        .filter_map(|h| manager.kext(*h))
        .map(|k| (k.identifier().to_string(), k.version().to_string()))
        .collect()
}

pub fn handle_identifier(manager: &KextManager, handle: KextHandle) -> String {
    manager
        .kext(handle)
        .map(|k| k.identifier().to_string())
        .unwrap_or_default()
}
