//! The kernel's driver catalog
//!
//! The catalog accepts serialized property-list bytes under two verbs: add
//! drivers and remove drivers. Personalities go up as a plist array;
//! removals are matched against a single template dictionary. The
//! transport itself is a trait so tests (and non-Mach hosts) can supply
//! their own.

use tracing::{debug, info, trace};

use kextmgr_core::{Error, Personality, Result};

use crate::kext::KextHandle;
use crate::manager::KextManager;

/// Catalog operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogVerb {
    /// Publish driver personalities
    AddDrivers,
    /// Withdraw personalities matching a template
    RemoveDrivers,
}

/// Transport handing serialized plist bytes to the kernel catalog
pub trait KernelCatalog {
    /// Send one buffer under the given verb
    fn send(&mut self, verb: CatalogVerb, data: &[u8]) -> Result<()>;
}

fn serialize_personalities(personalities: &[Personality]) -> Result<Vec<u8>> {
    let value = plist::Value::Array(personalities.iter().map(Personality::to_value).collect());
    let mut buffer = Vec::new();
    value
        .to_writer_xml(&mut buffer)
        .map_err(|_| Error::Serialization)?;
    Ok(buffer)
}

impl KextManager {
    /// Send an explicit set of personalities to the kernel catalog
    pub fn send_personalities_to_catalog(
        &self,
        catalog: &mut dyn KernelCatalog,
        personalities: &[Personality],
    ) -> Result<()> {
        info!(
            count = personalities.len(),
            "sending personalities to the kernel"
        );
        let data = serialize_personalities(personalities)?;
        catalog.send(CatalogVerb::AddDrivers, &data)
    }

    /// Send one kext's personalities, optionally a named subset
    ///
    /// Under safe boot, personalities with a nonzero `IOKitDebug` value are
    /// held back. With `interactive` set, each remaining personality is
    /// offered to the user-prompt capability for veto before sending.
    pub fn send_kext_personalities_to_catalog(
        &mut self,
        catalog: &mut dyn KernelCatalog,
        handle: KextHandle,
        personality_names: Option<&[&str]>,
        interactive: bool,
        safe_boot: bool,
    ) -> Result<()> {
        let kext = self
            .kext(handle)
            .ok_or_else(|| Error::kext_not_found(""))?;
        trace!(path = %kext.path().display(), "loading personalities for extension");

        let all = kext.copy_personalities();
        if all.is_empty() {
            return Err(Error::invalid_argument("extension has no personalities"));
        }

        let candidates: Vec<(String, Personality)> = match personality_names {
            Some(names) => {
                let mut picked = Vec::with_capacity(names.len());
                for name in names {
                    let personality = all
                        .get(*name)
                        .cloned()
                        .ok_or_else(|| Error::invalid_argument(format!("no personality {name:?}")))?;
                    picked.push((name.to_string(), personality));
                }
                picked
            }
            None => all.into_iter().collect(),
        };

        let mut names_to_send = Vec::new();
        let mut to_send = Vec::new();
        for (name, personality) in candidates {
            if safe_boot && !personality.eligible_during_safe_boot() {
                info!(
                    personality = name,
                    "safe boot mode active: personality has a nonzero IOKitDebug \
                     value and will not be sent to the kernel"
                );
                continue;
            }
            if interactive {
                let message = format!("Send personality {name:?} to the kernel");
                if !self.prompt.veto(true, &message)? {
                    continue;
                }
            }
            names_to_send.push(name);
            to_send.push(personality);
        }

        if to_send.is_empty() {
            return Ok(());
        }

        info!(names = ?names_to_send, "loading personalities");
        self.send_personalities_to_catalog(catalog, &to_send)
    }

    /// Collect every candidate head's personalities
    pub fn copy_all_kext_personalities(&mut self) -> Vec<Personality> {
        self.ensure_relationships();
        let mut personalities = Vec::new();
        for head in self.candidate_index.values() {
            if let Some(kext) = self.kext(*head) {
                personalities.extend(kext.personalities().values().cloned());
            }
        }
        personalities
    }

    /// Send every candidate head's personalities to the catalog
    pub fn send_all_kext_personalities_to_catalog(
        &mut self,
        catalog: &mut dyn KernelCatalog,
    ) -> Result<()> {
        let personalities = self.copy_all_kext_personalities();
        debug!(count = personalities.len(), "personalities to catalog");
        if personalities.is_empty() {
            return Ok(());
        }
        self.send_personalities_to_catalog(catalog, &personalities)
    }

    /// Withdraw every personality of a kext from the catalog
    pub fn remove_kext_personalities_from_catalog(
        &self,
        catalog: &mut dyn KernelCatalog,
        handle: KextHandle,
    ) -> Result<()> {
        let Some(kext) = self.kext(handle) else {
            return Err(Error::kext_not_found(""));
        };
        trace!(path = %kext.path().display(), "removing personalities for extension");

        for personality in kext.personalities().values() {
            self.remove_personalities_from_catalog(catalog, personality)?;
        }
        Ok(())
    }

    /// Withdraw personalities matching a template dictionary
    pub fn remove_personalities_from_catalog(
        &self,
        catalog: &mut dyn KernelCatalog,
        matching: &Personality,
    ) -> Result<()> {
        let mut buffer = Vec::new();
        matching
            .to_value()
            .to_writer_xml(&mut buffer)
            .map_err(|_| Error::Serialization)?;
        catalog.send(CatalogVerb::RemoveDrivers, &buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kext::{Kext, KextInfo};
    use kextmgr_core::{VersionNumber, IOKIT_DEBUG_KEY};
    use plist::Value;
    use std::path::Path;

    /// Records every buffer handed to the catalog
    #[derive(Default)]
    struct FakeCatalog {
        sent: Vec<(CatalogVerb, Value)>,
    }

    impl KernelCatalog for FakeCatalog {
        fn send(&mut self, verb: CatalogVerb, data: &[u8]) -> Result<()> {
            let value = Value::from_reader_xml(data).map_err(|_| Error::Serialization)?;
            self.sent.push((verb, value));
            Ok(())
        }
    }

    fn version(s: &str) -> VersionNumber {
        s.parse().unwrap()
    }

    fn kext_with_personalities(pairs: &[(&str, i64)]) -> Kext {
        let mut info = KextInfo::new("com.ex.driver", version("1.0"));
        for (name, debug_value) in pairs {
            let mut personality = Personality::new();
            personality.insert("IOClass", Value::String("ExDriver".into()));
            if *debug_value != 0 {
                personality.insert(IOKIT_DEBUG_KEY, Value::Integer((*debug_value).into()));
            }
            info.personalities.insert(name.to_string(), personality);
        }
        Kext::new(info, "/repo/driver.kext")
    }

    fn sent_array_len(catalog: &FakeCatalog) -> usize {
        match &catalog.sent[0].1 {
            Value::Array(items) => items.len(),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_send_kext_personalities() {
        let mut manager = KextManager::new();
        let repo = manager.add_repository(Path::new("/repo"), true).unwrap();
        let handle = manager
            .add_kext_to_repository(repo, kext_with_personalities(&[("Main", 0), ("Aux", 0)]))
            .unwrap();

        let mut catalog = FakeCatalog::default();
        manager
            .send_kext_personalities_to_catalog(&mut catalog, handle, None, false, false)
            .unwrap();

        assert_eq!(catalog.sent.len(), 1);
        assert_eq!(catalog.sent[0].0, CatalogVerb::AddDrivers);
        assert_eq!(sent_array_len(&catalog), 2);
    }

    #[test]
    fn test_safe_boot_filters_debug_personalities() {
        let mut manager = KextManager::new();
        let repo = manager.add_repository(Path::new("/repo"), true).unwrap();
        let handle = manager
            .add_kext_to_repository(
                repo,
                kext_with_personalities(&[("Quiet", 0), ("Noisy", 0xff)]),
            )
            .unwrap();

        let mut catalog = FakeCatalog::default();
        manager
            .send_kext_personalities_to_catalog(&mut catalog, handle, None, false, true)
            .unwrap();

        assert_eq!(sent_array_len(&catalog), 1);
    }

    #[test]
    fn test_no_personalities_is_invalid_argument() {
        let mut manager = KextManager::new();
        let repo = manager.add_repository(Path::new("/repo"), true).unwrap();
        let handle = manager
            .add_kext_to_repository(
                repo,
                Kext::new(
                    KextInfo::new("com.ex.plain", version("1.0")),
                    "/repo/plain.kext",
                ),
            )
            .unwrap();

        let mut catalog = FakeCatalog::default();
        let err = manager
            .send_kext_personalities_to_catalog(&mut catalog, handle, None, false, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(catalog.sent.is_empty());
    }

    #[test]
    fn test_remove_uses_remove_verb() {
        let manager = KextManager::new();
        let mut catalog = FakeCatalog::default();
        let mut template = Personality::new();
        template.insert("IOClass", Value::String("ExDriver".into()));

        manager
            .remove_personalities_from_catalog(&mut catalog, &template)
            .unwrap();

        assert_eq!(catalog.sent.len(), 1);
        assert_eq!(catalog.sent[0].0, CatalogVerb::RemoveDrivers);
    }

    #[test]
    fn test_send_all_reads_heads_only() {
        let mut manager = KextManager::new();
        let repo = manager.add_repository(Path::new("/repo"), true).unwrap();

        let mut old = KextInfo::new("com.ex.driver", version("1.0"));
        let mut p = Personality::new();
        p.insert("IOClass", Value::String("Old".into()));
        old.personalities.insert("Main".into(), p);

        let mut new = KextInfo::new("com.ex.driver", version("2.0"));
        let mut p = Personality::new();
        p.insert("IOClass", Value::String("New".into()));
        new.personalities.insert("Main".into(), p);

        manager
            .add_kext_to_repository(repo, Kext::new(old, "/repo/old.kext"))
            .unwrap();
        manager
            .add_kext_to_repository(repo, Kext::new(new, "/repo/new.kext"))
            .unwrap();

        let mut catalog = FakeCatalog::default();
        manager
            .send_all_kext_personalities_to_catalog(&mut catalog)
            .unwrap();

        assert_eq!(sent_array_len(&catalog), 1, "only the head's personality goes up");
    }
}
