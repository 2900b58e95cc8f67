//! # Code-range Registry
//!
//! Maps managed code ranges to the code manager of the module that owns
//! them, and tracks the unboxing-stub ranges.
//!
//! Readers never block writers for long: a lookup clones the current
//! [`Arc`] snapshot and searches it without holding a lock. Registration
//! rebuilds the table under a writer mutex and swaps the snapshot in, so a
//! walk that started earlier keeps a consistent older table.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codeman::{
    ClasslibFunctionId, CodeManager, DwarfCodeManager, LegacyCodeManager, MethodInfo, Win64CodeManager,
};
use crate::codeman::legacy::GC_INFO_SECTION;
use crate::error::{Result, WalkError};
use crate::image::{ImageFormat, ModuleImage};
use crate::types::Address;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

#[derive(Debug, Clone)]
struct CodeRange
{
    start: Address,
    size: u64,
    manager: Arc<dyn CodeManager>,
}

impl CodeRange
{
    fn end(&self) -> u64
    {
        self.start.value().saturating_add(self.size)
    }
}

#[derive(Debug, Default)]
struct Snapshot
{
    /// Sorted by start, non-overlapping
    code: Vec<CodeRange>,
    /// `(start, size)`, sorted by start
    stubs: Vec<(Address, u64)>,
}

fn overlaps(start: Address, size: u64, other_start: Address, other_size: u64) -> bool
{
    let end = start.value().saturating_add(size);
    let other_end = other_start.value().saturating_add(other_size);
    start.value() < other_end && other_start.value() < end
}

/// Process-wide table of registered modules
#[derive(Debug, Default)]
pub struct Registry
{
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Registry
{
    /// Empty registry, for tests and embedders that keep their own
    pub fn new() -> Self
    {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static Registry
    {
        &GLOBAL_REGISTRY
    }

    fn current(&self) -> Arc<Snapshot>
    {
        self.snapshot.read().clone()
    }

    /// Rebuild the table with `update` and publish it.
    fn update(&self, update: impl FnOnce(&mut Snapshot) -> bool) -> bool
    {
        let _guard = self.writer.lock();
        let current = self.current();
        let mut next = Snapshot {
            code: current.code.clone(),
            stubs: current.stubs.clone(),
        };
        if !update(&mut next) {
            return false;
        }
        *self.snapshot.write() = Arc::new(next);
        true
    }

    /// Register a manager for its code range.
    ///
    /// Returns `false` for an empty range or one overlapping a registered module.
    pub fn register_code_manager(&self, manager: Arc<dyn CodeManager>) -> bool
    {
        let (start, size) = manager.code_range();
        let registered = self.update(|snapshot| {
            if size == 0 || snapshot.code.iter().any(|range| overlaps(start, size, range.start, range.size)) {
                return false;
            }
            let index = snapshot.code.partition_point(|range| range.start.value() < start.value());
            snapshot.code.insert(index, CodeRange { start, size, manager });
            true
        });
        if registered {
            debug!(start = %start, size, "registered code range");
        } else {
            warn!(start = %start, size, "code range rejected");
        }
        registered
    }

    /// Remove the module whose code range starts at `start`.
    pub fn unregister_code_manager(&self, start: Address) -> bool
    {
        self.update(|snapshot| {
            let before = snapshot.code.len();
            snapshot.code.retain(|range| range.start != start);
            snapshot.code.len() != before
        })
    }

    /// Register an unboxing-stub range; `false` if it overlaps one already known.
    pub fn register_unboxing_stubs(&self, start: Address, size: u64) -> bool
    {
        self.update(|snapshot| {
            if snapshot.stubs.iter().any(|(other, other_size)| overlaps(start, size, *other, *other_size)) {
                return false;
            }
            let index = snapshot.stubs.partition_point(|(other, _)| other.value() < start.value());
            snapshot.stubs.insert(index, (start, size));
            true
        })
    }

    /// Register a loaded module.
    ///
    /// The code manager is chosen from the image: PE images get the x64
    /// manager, ELF and Mach-O images the DWARF one, and raw images the
    /// legacy one when they carry `.gcinfo`. An empty stub range registers no
    /// stubs. When the stub range cannot be registered the module is
    /// unregistered again and the call fails.
    pub fn register_os_module(
        &self,
        image: ModuleImage,
        code_range: (Address, u64),
        unboxing_stubs: (Address, u64),
        classlib: &[Address],
    ) -> bool
    {
        let base = image.base();
        let manager = match create_code_manager(image, code_range, classlib.to_vec()) {
            Ok(manager) => manager,
            Err(err) => {
                warn!(base = %base, error = %err, "module not registered");
                return false;
            }
        };
        if !self.register_code_manager(manager) {
            return false;
        }

        let (stub_start, stub_size) = unboxing_stubs;
        if stub_size != 0 && !self.register_unboxing_stubs(stub_start, stub_size) {
            warn!(base = %base, stubs = %stub_start, "unboxing stub range rejected, unregistering module");
            self.unregister_code_manager(code_range.0);
            return false;
        }

        info!(base = %base, code = %code_range.0, size = code_range.1, "registered module");
        true
    }

    /// Manager owning `ip`
    pub fn find_code_manager(&self, ip: Address) -> Option<Arc<dyn CodeManager>>
    {
        let snapshot = self.current();
        let index = snapshot
            .code
            .partition_point(|range| range.start.value() <= ip.value())
            .checked_sub(1)?;
        let range = snapshot.code.get(index)?;
        (ip.value() < range.end()).then(|| Arc::clone(&range.manager))
    }

    /// Method info for `ip` together with its manager.
    ///
    /// ## Errors
    ///
    /// `MethodNotFound` when no registered module owns `ip`.
    pub fn find_method_info(&self, ip: Address) -> Result<(Arc<dyn CodeManager>, MethodInfo)>
    {
        let manager = self.find_code_manager(ip).ok_or(WalkError::MethodNotFound { ip })?;
        let info = manager.find_method_info(ip)?;
        Ok((manager, info))
    }

    pub fn is_unboxing_stub(&self, ip: Address) -> bool
    {
        let snapshot = self.current();
        snapshot
            .stubs
            .iter()
            .any(|(start, size)| ip.value() >= start.value() && ip.value() - start.value() < *size)
    }

    pub fn find_method_start_address(&self, ip: Address) -> Option<Address>
    {
        let (manager, info) = self.find_method_info(ip).ok()?;
        Some(manager.get_method_start_address(&info))
    }

    pub fn get_associated_data(&self, ip: Address) -> Option<Address>
    {
        self.find_code_manager(ip)?.get_associated_data(ip)
    }

    /// Classlib function of the module owning `ip`.
    pub fn get_classlib_function(&self, ip: Address, id: ClasslibFunctionId) -> Option<Address>
    {
        self.find_code_manager(ip)?.get_classlib_function(id)
    }

    pub fn module_count(&self) -> usize
    {
        self.current().code.len()
    }
}

/// Code manager for an image, restricted to `code_range`.
///
/// ## Errors
///
/// `Object` when the image has none of the metadata a manager needs, and
/// the manager's own construction errors.
pub fn create_code_manager(
    image: ModuleImage,
    code_range: (Address, u64),
    classlib: Vec<Address>,
) -> Result<Arc<dyn CodeManager>>
{
    let (start, size) = code_range;
    let manager: Arc<dyn CodeManager> = match image.format() {
        ImageFormat::Pe => Arc::new(Win64CodeManager::new(image, classlib)?.with_code_range(start, size)),
        ImageFormat::Elf | ImageFormat::MachO => {
            Arc::new(DwarfCodeManager::new(image, classlib)?.with_code_range(start, size))
        }
        ImageFormat::Raw if image.section(GC_INFO_SECTION).is_some() => {
            Arc::new(LegacyCodeManager::new(image, classlib)?.with_code_range(start, size))
        }
        ImageFormat::Raw if image.section(".pdata").is_some() => {
            Arc::new(Win64CodeManager::new(image, classlib)?.with_code_range(start, size))
        }
        ImageFormat::Raw if image.section(".eh_frame").is_some() => {
            Arc::new(DwarfCodeManager::new(image, classlib)?.with_code_range(start, size))
        }
        ImageFormat::Raw => {
            return Err(WalkError::Object("image has no method tables".to_string()));
        }
    };
    debug!(kind = %manager.kind(), "created code manager");
    Ok(manager)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_overlap()
    {
        let at = Address::new;
        assert!(overlaps(at(0x100), 0x10, at(0x108), 0x10));
        assert!(!overlaps(at(0x100), 0x10, at(0x110), 0x10));
        assert!(!overlaps(at(0x110), 0x10, at(0x100), 0x10));
    }

    #[test]
    fn test_image_without_tables()
    {
        let image = ModuleImage::new(crate::types::Architecture::Amd64, Address::new(0x1000));
        let err = create_code_manager(image, (Address::new(0x1000), 0x10), Vec::new()).unwrap_err();
        assert!(matches!(err, WalkError::Object(_)));
    }

    #[test]
    fn test_empty_registry()
    {
        let registry = Registry::new();
        assert_eq!(registry.module_count(), 0);
        assert!(registry.find_code_manager(Address::new(0x1000)).is_none());
        assert!(!registry.is_unboxing_stub(Address::new(0x1000)));
    }
}
