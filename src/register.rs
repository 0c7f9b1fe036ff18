use anyhow::bail;
use rustc_hash::FxHashMap;

/// A named location in the device's address space. Plain registers are one word;
///  block registers span `size` consecutive words; ports re-address the same word
///  `size` times, which is how FIFOs are drained and filled.
///
/// Mask fields name bit ranges within a register, for devices that pack several
///  logical values into one word.
#[derive(Clone, Debug)]
pub struct Register {
    pub name: String,
    pub addr: u32,
    pub non_incrementing: bool,
    /// in words
    pub size: u32,
    masks: FxHashMap<String, u32>,
}

impl Register {
    pub fn new(name: impl Into<String>, addr: u32) -> Register {
        Register {
            name: name.into(),
            addr,
            non_incrementing: false,
            size: 1,
            masks: FxHashMap::default(),
        }
    }

    pub fn block(name: impl Into<String>, addr: u32, size: u32) -> Register {
        Register {
            size,
            ..Register::new(name, addr)
        }
    }

    pub fn port(name: impl Into<String>, addr: u32, size: u32) -> Register {
        Register {
            non_incrementing: true,
            size,
            ..Register::new(name, addr)
        }
    }

    pub fn with_mask(mut self, field: impl Into<String>, mask: u32) -> Register {
        self.masks.insert(field.into(), mask);
        self
    }

    pub fn mask(&self, field: &str) -> anyhow::Result<u32> {
        match self.masks.get(field) {
            Some(&mask) if mask != 0 => Ok(mask),
            Some(_) => bail!("mask for field {}.{} is zero", self.name, field),
            None => bail!("register {} has no field {}", self.name, field),
        }
    }

    /// extracts a named mask field from a raw register value, shifted down to bit 0
    pub fn field(&self, field: &str, raw: u32) -> anyhow::Result<u32> {
        let mask = self.mask(field)?;
        Ok((raw & mask) >> mask.trailing_zeros())
    }

    /// places a value into a named mask field, shifted up from bit 0 and truncated
    ///  to the field's width
    pub fn place_field(&self, field: &str, value: u32) -> anyhow::Result<u32> {
        let mask = self.mask(field)?;
        Ok((value << mask.trailing_zeros()) & mask)
    }
}
