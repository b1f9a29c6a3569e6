//! Load preparation and dispatch
//!
//! Preparation is a pre-flight chain: admission checks, relationship
//! repair, the running-kernel loaded-set check, a fresh dependency
//! resolution for the target, and authentication of the whole closure.
//! Only a target that clears every step reaches the driver. A failed
//! dispatch quarantines the bundle and invalidates the index so later
//! resolutions are not poisoned.

mod driver;

pub use driver::{DependencyGraph, DriverRequest, GraphEntry, LinkLoadDriver};

use std::path::PathBuf;

use tracing::{debug, error, info};

use kextmgr_core::{Error, Personality, Result};

use crate::catalog::KernelCatalog;
use crate::kernel::LoadedKernel;
use crate::kext::KextHandle;
use crate::manager::KextManager;

const DEFAULT_KERNEL_FILE: &str = "/mach";

/// Explicit load address for one module, for symbol generation without a
/// running load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleAddress {
    pub module: String,
    pub address: u64,
}

/// Caller options for one load
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Consult the running kernel before resolving dependencies
    pub check_loaded_for_dependencies: bool,
    /// Actually load the target into the kernel
    pub do_load: bool,
    /// Start the target's code after loading
    pub do_start: bool,
    /// Generate prelinked output instead of loading
    pub do_prelink: bool,
    /// The request comes from the kext daemon itself
    pub kextd_request: bool,
    /// Kernel file for the linker; the standard kernel when absent
    pub kernel_file: Option<PathBuf>,
    pub patch_dir: Option<PathBuf>,
    pub symbol_dir: Option<PathBuf>,
    pub interactive_level: u8,
    pub ask_overwrite_symbols: bool,
    pub overwrite_symbols: bool,
    /// Take symbol addresses from the running kernel
    pub use_kernel_addresses: bool,
    /// Explicit per-module addresses for symbol generation
    pub load_addresses: Vec<ModuleAddress>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            check_loaded_for_dependencies: true,
            do_load: true,
            do_start: true,
            do_prelink: false,
            kextd_request: false,
            kernel_file: None,
            patch_dir: None,
            symbol_dir: None,
            interactive_level: 0,
            ask_overwrite_symbols: false,
            overwrite_symbols: false,
            use_kernel_addresses: false,
            load_addresses: Vec::new(),
        }
    }
}

impl KextManager {
    /// Load a kext with default options
    pub fn load_kext(
        &mut self,
        handle: KextHandle,
        driver: &mut dyn LinkLoadDriver,
        kernel: Option<&dyn LoadedKernel>,
        catalog: Option<&mut dyn KernelCatalog>,
    ) -> Result<()> {
        self.load_kext_using_options(handle, &LoadOptions::default(), driver, kernel, catalog)
    }

    /// Load a kext found by identifier with default options
    pub fn load_kext_with_identifier(
        &mut self,
        identifier: &str,
        driver: &mut dyn LinkLoadDriver,
        kernel: Option<&dyn LoadedKernel>,
        catalog: Option<&mut dyn KernelCatalog>,
    ) -> Result<()> {
        let handle = self
            .get_kext_with_identifier(identifier)
            .ok_or_else(|| Error::kext_not_found(identifier))?;
        self.load_kext(handle, driver, kernel, catalog)
    }

    /// Run preparation, then dispatch the load to the driver
    pub fn load_kext_using_options(
        &mut self,
        handle: KextHandle,
        options: &LoadOptions,
        driver: &mut dyn LinkLoadDriver,
        kernel: Option<&dyn LoadedKernel>,
        catalog: Option<&mut dyn KernelCatalog>,
    ) -> Result<()> {
        self.prepare_kext_for_loading(
            handle,
            options.check_loaded_for_dependencies,
            options.do_load,
            kernel,
            None,
        )?;
        self.dispatch_load(handle, options, driver, catalog)
    }

    /// Pre-flight a kext for loading
    ///
    /// With a deferred collector supplied, dependency bundles that fail
    /// authentication are appended to it instead of being disqualified on
    /// the spot; the authentication error is still returned.
    pub fn prepare_kext_for_loading(
        &mut self,
        handle: KextHandle,
        check_loaded_for_dependencies: bool,
        do_load: bool,
        kernel: Option<&dyn LoadedKernel>,
        mut inauthentic: Option<&mut Vec<KextHandle>>,
    ) -> Result<()> {
        let name = self.kext_display(handle);
        info!(extension = %name, "loading extension");

        let kext = self.kext(handle).ok_or_else(|| Error::kext_not_found(""))?;
        let identifier = kext.identifier().to_string();

        if !kext.is_valid() {
            error!(extension = %name, "request to load invalid extension");
            return Err(Error::validation(identifier));
        }
        if self.safe_boot_mode() && !kext.is_eligible_during_safe_boot() {
            error!(
                extension = %name,
                "request to load non-safe-boot extension during safe boot"
            );
            return Err(Error::boot_level(identifier));
        }
        if !kext.is_enabled() {
            error!(extension = %name, "request to load disabled extension");
            return Err(Error::disabled(identifier));
        }

        self.ensure_relationships();

        if check_loaded_for_dependencies {
            if let Some(kernel) = kernel {
                if let Err(err) = self.check_for_loaded_kexts(kernel) {
                    error!("can't check which kernel extensions are currently loaded");
                    return Err(err);
                }
                if do_load {
                    let kext = self.kext(handle).ok_or_else(|| Error::kext_not_found(""))?;
                    if kext.is_loaded() {
                        debug!(extension = %name, "kernel extension is already loaded");
                        return Err(Error::already_loaded(identifier));
                    }
                    if kext.other_version_is_loaded() {
                        error!(
                            extension = %name,
                            "a different version of kernel extension is already loaded"
                        );
                        return Err(Error::loaded_version_differs(identifier));
                    }
                }
            }
        }

        // blow away all dependency info so what we resolve is current
        self.clear_dependency_relationships();
        if let Err(err) = self.resolve_kext_dependencies(handle) {
            self.missing_deps.push(handle);
            error!(
                extension = %name,
                "cannot resolve dependencies for kernel extension"
            );
            // not a hard failure; the kext is not disqualified
            return Err(err);
        }

        self.disable_clear();
        // do not return until the matching enable_clear() below

        let mut result: Result<()> = Ok(());
        let closure = match self.copy_all_dependencies(handle) {
            Ok(closure) => closure,
            Err(err) => {
                self.enable_clear();
                return Err(err);
            }
        };

        let strict = self.performs_strict_authentication();
        for member in closure {
            let Some(kext) = self.kext(member) else {
                continue;
            };

            if kext.other_version_is_loaded() {
                error!(
                    dependency = %self.kext_display(member),
                    "a different version of dependency extension is already loaded"
                );
                let member_id = self
                    .kext(member)
                    .map(|k| k.identifier().to_string())
                    .unwrap_or_default();
                combine(
                    &mut result,
                    Error::dependency_loaded_version_differs(member_id),
                );
                if !self.performs_full_tests() {
                    break;
                }
            }

            let Some(kext) = self.kext(member) else {
                continue;
            };
            if kext.is_authentic() {
                continue;
            }

            let auth_result = self.authenticator.authenticate(kext, strict);
            match auth_result {
                Ok(()) => {
                    if let Some(kext) = self.kext_mut(member) {
                        kext.mark_authentic();
                    }
                }
                Err(err) => {
                    let is_authentication = matches!(err, Error::Authentication { .. });
                    let is_cache = matches!(err, Error::Cache { .. });
                    combine(&mut result, err);

                    if is_authentication {
                        match inauthentic.as_deref_mut() {
                            Some(collector) => {
                                collector.push(member);
                                continue;
                            }
                            None => {
                                error!(
                                    dependency = %self.kext_display(member),
                                    "authentication failed for extension"
                                );
                                self.disqualify_kext(member);
                                if !self.performs_full_tests() {
                                    break;
                                }
                            }
                        }
                    } else if is_cache {
                        error!(
                            dependency = %self.kext_display(member),
                            "cache inconsistency noted for extension"
                        );
                    } else {
                        error!(
                            dependency = %self.kext_display(member),
                            "error during authentication of extension"
                        );
                    }
                }
            }
        }

        self.enable_clear();
        result
    }

    /// Hand a prepared target to the link/load driver
    fn dispatch_load(
        &mut self,
        handle: KextHandle,
        options: &LoadOptions,
        driver: &mut dyn LinkLoadDriver,
        catalog: Option<&mut dyn KernelCatalog>,
    ) -> Result<()> {
        let result = self.dispatch_load_inner(handle, options, driver, catalog);

        // a failed load quarantines the bundle and forces a rebuild so the
        // failure cannot poison later resolutions
        if let Err(err) = &result {
            if !matches!(err, Error::AlreadyLoaded { .. }) {
                if let Some(kext) = self.kext_mut(handle) {
                    kext.set_load_failed(true);
                }
                self.clear_relationships();
            }
        }
        result
    }

    fn dispatch_load_inner(
        &mut self,
        handle: KextHandle,
        options: &LoadOptions,
        driver: &mut dyn LinkLoadDriver,
        mut catalog: Option<&mut dyn KernelCatalog>,
    ) -> Result<()> {
        let name = self.kext_display(handle);

        let (do_load, do_prelink) = if options.symbol_dir.is_some() && options.do_prelink {
            (false, true)
        } else {
            (options.do_load, false)
        };

        // for non-kextd load requests of a kext with no personalities, give
        // the kernel a chance to load it from its own prelinked set first
        if do_load && !options.kextd_request {
            let demand = self.kext(handle).and_then(|kext| {
                (!kext.has_personalities())
                    .then(|| Personality::module_demand(kext.identifier()))
            });
            if let (Some(demand), Some(catalog)) = (demand, catalog.as_deref_mut()) {
                let _ = self.send_personalities_to_catalog(catalog, &[demand]);
            }
        }

        let mut graph = match self.build_dependency_graph(handle) {
            Ok(graph) => graph,
            Err(_) => {
                error!(extension = %name, "can't generate internal dependency graph");
                self.disqualify_kext(handle);
                return Err(Error::Unspecified);
            }
        };

        let request = DriverRequest {
            kernel_file: options
                .kernel_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KERNEL_FILE)),
            patch_dir: options.patch_dir.clone(),
            symbol_dir: options.symbol_dir.clone(),
            do_load,
            do_start: options.do_start,
            do_prelink,
            interactive_level: options.interactive_level,
            ask_overwrite_symbols: options.ask_overwrite_symbols,
            overwrite_symbols: options.overwrite_symbols,
        };

        // symbol-only runs need an address for every module up front
        if !do_load && !do_prelink && options.symbol_dir.is_some() && !options.use_kernel_addresses
        {
            self.assign_load_addresses(&mut graph, options)?;
        }

        let result = if !self.performs_loads_in_process() {
            match driver.child_command(&graph, &request) {
                Some(command) => driver::run_in_child(command),
                None => driver.load(&graph, &request),
            }
        } else {
            driver.load(&graph, &request)
        };

        if let Err(err) = &result {
            match err {
                Error::AlreadyLoaded { .. } => {
                    debug!(extension = %name, "kernel extension is already loaded");
                }
                Error::LoadedVersionDiffers { .. } => {
                    error!(
                        extension = %name,
                        "a different version of the extension, or of one of its \
                         dependencies, is already loaded"
                    );
                }
                Error::UserAbort => {
                    error!(extension = %name, "the user aborted the load of extension");
                }
                _ => {
                    error!(extension = %name, "a link/load error occurred for kernel extension");
                }
            }
        }
        result
    }

    fn build_dependency_graph(&self, handle: KextHandle) -> Result<DependencyGraph> {
        let closure = self.copy_all_dependencies(handle)?;
        let mut entries = Vec::with_capacity(closure.len());
        for member in closure {
            let kext = self.kext(member).ok_or_else(|| Error::kext_not_found(""))?;
            entries.push(GraphEntry {
                handle: member,
                identifier: kext.identifier().to_string(),
                version: kext.version(),
                path: kext.path().to_path_buf(),
                has_executable: kext.has_executable(),
                load_address: None,
            });
        }
        Ok(DependencyGraph { entries })
    }

    /// Give every executable module an address, from the caller's list or
    /// by prompting for one
    fn assign_load_addresses(
        &mut self,
        graph: &mut DependencyGraph,
        options: &LoadOptions,
    ) -> Result<()> {
        if !options.load_addresses.is_empty() {
            for entry in &mut graph.entries {
                if let Some(given) = options
                    .load_addresses
                    .iter()
                    .find(|a| a.module == entry.identifier)
                {
                    entry.load_address = Some(given.address);
                }
            }
            let unset: Vec<&str> = graph
                .entries
                .iter()
                .filter(|e| e.has_executable && e.load_address.is_none())
                .map(|e| e.identifier.as_str())
                .collect();
            if !unset.is_empty() {
                error!(modules = ?unset, "these modules don't have addresses set");
                return Err(Error::invalid_argument("missing module load addresses"));
            }
            return Ok(());
        }

        for entry in &mut graph.entries {
            if !entry.has_executable {
                continue;
            }
            let message = format!("enter the load address for module {}", entry.identifier);
            let reply = self.prompt.input(&message)?;
            let address = reply
                .as_deref()
                .map(parse_address)
                .transpose()?
                .flatten();
            match address {
                Some(address) => entry.load_address = Some(address),
                None => {
                    error!("error getting load addresses");
                    return Err(Error::Unspecified);
                }
            }
        }
        Ok(())
    }
}

fn parse_address(text: &str) -> Result<Option<u64>> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    match u64::from_str_radix(digits, 16) {
        Ok(address) if address != 0 => Ok(Some(address)),
        Ok(_) => Ok(None),
        Err(_) => Err(Error::invalid_argument(format!(
            "bad load address: {text:?}"
        ))),
    }
}

fn combine(result: &mut Result<()>, err: Error) {
    match result {
        Ok(()) => *result = Err(err),
        Err(existing) if existing.same_kind(&err) => {}
        Err(_) => *result = Err(Error::Unspecified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_keeps_single_kind() {
        let mut result = Ok(());
        combine(&mut result, Error::authentication("a"));
        combine(&mut result, Error::authentication("b"));
        assert!(matches!(result, Err(Error::Authentication { .. })));
    }

    #[test]
    fn test_combine_mixed_kinds_collapse_to_unspecified() {
        let mut result = Ok(());
        combine(&mut result, Error::authentication("a"));
        combine(&mut result, Error::dependency_loaded_version_differs("b"));
        assert_eq!(result, Err(Error::Unspecified));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0xffff1000").unwrap(), Some(0xffff_1000));
        assert_eq!(parse_address("beef").unwrap(), Some(0xbeef));
        assert_eq!(parse_address("0x0").unwrap(), None);
        assert!(parse_address("not hex").is_err());
    }
}
