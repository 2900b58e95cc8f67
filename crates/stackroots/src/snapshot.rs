//! Captured-thread snapshot files for `stackroots walk`.
//!
//! One `key=value` per line; blank lines and lines starting with `#` are
//! skipped. Numbers are hexadecimal with an optional `0x`.
//!
//! ```text
//! arch=amd64
//! ip=0x401020
//! sp=0x7ffc0000
//! context=0x7fff0000        # where register values are spilled (optional)
//! reg.rbp=0x7ffc0040
//! mem.0x7ffc0000=20104000000000000000
//! module=0x400000           # module base
//! section..text=0x401000:554889e5...
//! section..gcinfo=0x402000:@gcinfo.bin
//! fault=1                   # the thread stopped at a hardware fault
//! ```

use std::fs;
use std::path::Path;

use stackroots_core::image::ModuleImage;
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::{regs, RegDisplay};
use stackroots_core::{Address, Architecture, WalkError};

/// A parsed snapshot
pub struct Snapshot
{
    pub display: RegDisplay,
    pub memory: SnapshotMemory,
    pub module: Option<ModuleImage>,
    pub from_fault: bool,
}

/// Parse a hex number with an optional `0x` prefix.
pub fn parse_hex(text: &str) -> Result<u64, WalkError>
{
    let digits = text.trim();
    let digits = digits.strip_prefix("0x").unwrap_or(digits);
    u64::from_str_radix(digits, 16).map_err(|_| WalkError::InvalidArgument(format!("bad hex number '{text}'")))
}

/// Read bytes given inline as hex or as `@path` to a binary file.
pub fn read_input(text: &str, relative_to: Option<&Path>) -> Result<Vec<u8>, WalkError>
{
    if let Some(path) = text.strip_prefix('@') {
        let path = match relative_to {
            Some(dir) => dir.join(path),
            None => Path::new(path).to_path_buf(),
        };
        return Ok(fs::read(path)?);
    }
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    hex::decode(digits).map_err(|err| WalkError::InvalidArgument(format!("bad hex bytes: {err}")))
}

fn register_number(arch: Architecture, name: &str) -> Result<u8, WalkError>
{
    (0..regs::slot_count(arch) as u8)
        .find(|reg| regs::name(arch, *reg).eq_ignore_ascii_case(name))
        .ok_or_else(|| WalkError::InvalidArgument(format!("unknown {arch} register '{name}'")))
}

fn default_context(arch: Architecture) -> Address
{
    if arch.pointer_size() == 4 {
        Address::new(0xfff0_0000)
    } else {
        Address::new(0xffff_0000_0000)
    }
}

impl Snapshot
{
    pub fn load(path: &Path) -> Result<Self, WalkError>
    {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, path.parent())
    }

    /// Parse snapshot text; `@file` references are resolved from `dir`.
    pub fn parse(text: &str, dir: Option<&Path>) -> Result<Self, WalkError>
    {
        let lines = text
            .lines()
            .map(|line| line.split_once(" #").map_or(line, |(value, _)| value).trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                line.split_once('=')
                    .map(|(key, value)| (key.trim(), value.trim()))
                    .ok_or_else(|| WalkError::InvalidArgument(format!("expected key=value, got '{line}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let arch = lines
            .iter()
            .find(|(key, _)| *key == "arch")
            .map(|(_, value)| value.parse::<Architecture>())
            .transpose()?
            .ok_or_else(|| WalkError::InvalidArgument("snapshot has no arch".to_string()))?;

        let mut display = RegDisplay::new(arch);
        let mut memory = SnapshotMemory::new();
        let mut module: Option<ModuleImage> = None;
        let mut from_fault = false;
        let mut context = default_context(arch);

        for (key, value) in &lines {
            match *key {
                "arch" => {}
                "ip" => display.ip = Address::new(parse_hex(value)?),
                "sp" => display.sp = Address::new(parse_hex(value)?),
                "context" => context = Address::new(parse_hex(value)?),
                "fault" => from_fault = parse_hex(value)? != 0,
                "module" => module = Some(ModuleImage::new(arch, Address::new(parse_hex(value)?))),
                _ => {
                    if let Some(name) = key.strip_prefix("reg.") {
                        let reg = register_number(arch, name)?;
                        display.spill(&mut memory, context, reg, parse_hex(value)?);
                    } else if let Some(address) = key.strip_prefix("mem.") {
                        memory.write_bytes(Address::new(parse_hex(address)?), &read_input(value, dir)?);
                    } else if let Some(name) = key.strip_prefix("section.") {
                        let image = module
                            .as_mut()
                            .ok_or_else(|| WalkError::InvalidArgument("section before module".to_string()))?;
                        let (address, data) = value
                            .split_once(':')
                            .ok_or_else(|| WalkError::InvalidArgument(format!("expected address:bytes for {name}")))?;
                        image.add_section(name, Address::new(parse_hex(address)?), read_input(data, dir)?);
                    } else {
                        return Err(WalkError::InvalidArgument(format!("unknown snapshot key '{key}'")));
                    }
                }
            }
        }

        Ok(Self {
            display,
            memory,
            module,
            from_fault,
        })
    }
}
