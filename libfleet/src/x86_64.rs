//! x86-64 specifics: which relocation types require which synthetic table slots, how each
//! relocation is applied to the output bytes, and the PLT entry format.

use crate::bail;
use crate::error::Result;
use crate::symbol::NEEDS_GOT;
use crate::symbol::NEEDS_GOTTP;
use crate::symbol::NEEDS_PLT;
use std::borrow::Cow;

pub(crate) const PLT_ENTRY_TEMPLATE: &[u8; 16] = &[
    0xff, 0x25, 0x0, 0x0, 0x0, 0x0, // jmp *{relative GOTPLT address}(%rip)
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // nop padding
];

/// Fills in a PLT entry that jumps through the supplied GOTPLT slot.
pub(crate) fn write_plt_entry(
    plt_entry: &mut [u8],
    gotplt_address: u64,
    plt_address: u64,
) -> Result {
    plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);
    let offset: i32 = (gotplt_address.wrapping_sub(plt_address + 6) as i64)
        .try_into()
        .map_err(|_| anyhow::anyhow!("PLT entry is more than 2GiB away from its GOT slot"))?;
    plt_entry[2..6].copy_from_slice(&offset.to_le_bytes());
    Ok(())
}

/// Returns the mask of NEEDS_* bits implied by a relocation of the given type, or an error for
/// relocation types we don't implement. Direct absolute and PC-relative references need no slot.
pub(crate) fn relocation_needs(r_type: u32) -> Result<u8> {
    let needs = match r_type {
        object::elf::R_X86_64_PLT32 => NEEDS_PLT,
        object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX => NEEDS_GOT,
        object::elf::R_X86_64_GOTTPOFF => NEEDS_GOTTP,
        object::elf::R_X86_64_NONE
        | object::elf::R_X86_64_8
        | object::elf::R_X86_64_16
        | object::elf::R_X86_64_32
        | object::elf::R_X86_64_32S
        | object::elf::R_X86_64_64
        | object::elf::R_X86_64_PC8
        | object::elf::R_X86_64_PC16
        | object::elf::R_X86_64_PC32
        | object::elf::R_X86_64_PC64
        | object::elf::R_X86_64_TPOFF32
        | object::elf::R_X86_64_TPOFF64 => 0,
        _ => bail!("unsupported relocation type {}", rel_type_to_string(r_type)),
    };
    Ok(needs)
}

/// Everything needed to compute the value a relocation resolves to. Addresses are absolute.
#[derive(Default, Clone, Copy)]
pub(crate) struct RelocationTarget {
    /// S: the address of the referenced symbol.
    pub(crate) address: u64,
    /// The address of the symbol's PLT entry, when it has one.
    pub(crate) plt_address: Option<u64>,
    /// The address of the symbol's GOT slot, when it has one.
    pub(crate) got_address: Option<u64>,
    /// The address of the symbol's TP-offset GOT slot, when it has one.
    pub(crate) gottp_address: Option<u64>,
    /// Undefined weak references resolve to zero regardless of relocation type.
    pub(crate) undef_weak: bool,
}

/// Applies one relocation. `place` (P) is the absolute address of the relocated field and `out`
/// is the field's position in the output buffer.
pub(crate) fn apply_relocation(
    out: &mut [u8],
    r_type: u32,
    target: &RelocationTarget,
    addend: i64,
    place: u64,
    tls_end: u64,
) -> Result {
    if target.undef_weak {
        return write_value(out, r_type, 0);
    }

    let s = target.address;
    let a = addend as u64;

    let value = match r_type {
        object::elf::R_X86_64_NONE => return Ok(()),
        object::elf::R_X86_64_8
        | object::elf::R_X86_64_16
        | object::elf::R_X86_64_32
        | object::elf::R_X86_64_32S
        | object::elf::R_X86_64_64 => s.wrapping_add(a),
        object::elf::R_X86_64_PC8
        | object::elf::R_X86_64_PC16
        | object::elf::R_X86_64_PC32
        | object::elf::R_X86_64_PC64 => s.wrapping_add(a).wrapping_sub(place),
        object::elf::R_X86_64_PLT32 => {
            // When the target ended up without a PLT entry (it never acquired NEEDS_PLT, e.g.
            // because it resolved to a local definition elsewhere), branch to it directly.
            let l = target.plt_address.unwrap_or(s);
            l.wrapping_add(a).wrapping_sub(place)
        }
        object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX => {
            let Some(g) = target.got_address else {
                bail!("GOT relocation against a symbol without a GOT slot");
            };
            g.wrapping_add(a).wrapping_sub(place)
        }
        object::elf::R_X86_64_GOTTPOFF => {
            let Some(g) = target.gottp_address else {
                bail!("GOTTPOFF relocation against a symbol without a GOT slot");
            };
            g.wrapping_add(a).wrapping_sub(place)
        }
        object::elf::R_X86_64_TPOFF32 | object::elf::R_X86_64_TPOFF64 => {
            s.wrapping_add(a).wrapping_sub(tls_end)
        }
        _ => bail!("unsupported relocation type {}", rel_type_to_string(r_type)),
    };

    write_value(out, r_type, value)
}

fn write_value(out: &mut [u8], r_type: u32, value: u64) -> Result {
    match r_type {
        object::elf::R_X86_64_NONE => Ok(()),
        object::elf::R_X86_64_8 => {
            let v: u8 = checked(value as i64, i64::from(u8::MIN), i64::from(u8::MAX), r_type)?;
            write_bytes(out, &v.to_le_bytes(), r_type)
        }
        object::elf::R_X86_64_PC8 => {
            let v: i8 = checked(value as i64, i64::from(i8::MIN), i64::from(i8::MAX), r_type)?;
            write_bytes(out, &v.to_le_bytes(), r_type)
        }
        object::elf::R_X86_64_16 => {
            let v: u16 = checked(value as i64, 0, i64::from(u16::MAX), r_type)?;
            write_bytes(out, &v.to_le_bytes(), r_type)
        }
        object::elf::R_X86_64_PC16 => {
            let v: i16 = checked(value as i64, i64::from(i16::MIN), i64::from(i16::MAX), r_type)?;
            write_bytes(out, &v.to_le_bytes(), r_type)
        }
        object::elf::R_X86_64_32 => {
            let v: u32 = checked(value as i64, 0, i64::from(u32::MAX), r_type)?;
            write_bytes(out, &v.to_le_bytes(), r_type)
        }
        object::elf::R_X86_64_32S
        | object::elf::R_X86_64_PC32
        | object::elf::R_X86_64_PLT32
        | object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX
        | object::elf::R_X86_64_GOTTPOFF
        | object::elf::R_X86_64_TPOFF32 => {
            let v: i32 = checked(value as i64, i64::from(i32::MIN), i64::from(i32::MAX), r_type)?;
            write_bytes(out, &v.to_le_bytes(), r_type)
        }
        object::elf::R_X86_64_64 | object::elf::R_X86_64_PC64 | object::elf::R_X86_64_TPOFF64 => {
            write_bytes(out, &value.to_le_bytes(), r_type)
        }
        _ => bail!("unsupported relocation type {}", rel_type_to_string(r_type)),
    }
}

fn write_bytes(out: &mut [u8], bytes: &[u8], r_type: u32) -> Result {
    let Some(dest) = out.get_mut(..bytes.len()) else {
        bail!(
            "relocation {} extends past the end of its section",
            rel_type_to_string(r_type)
        );
    };
    dest.copy_from_slice(bytes);
    Ok(())
}

fn checked<T: TryFrom<i64>>(value: i64, min: i64, max: i64, r_type: u32) -> Result<T> {
    if value < min || value > max {
        bail!(
            "relocation {} out of range: {value:#x}",
            rel_type_to_string(r_type)
        );
    }
    T::try_from(value).map_err(|_| anyhow::anyhow!("relocation value out of range"))
}

pub(crate) fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    let name = match r_type {
        object::elf::R_X86_64_NONE => "R_X86_64_NONE",
        object::elf::R_X86_64_64 => "R_X86_64_64",
        object::elf::R_X86_64_PC32 => "R_X86_64_PC32",
        object::elf::R_X86_64_GOT32 => "R_X86_64_GOT32",
        object::elf::R_X86_64_PLT32 => "R_X86_64_PLT32",
        object::elf::R_X86_64_COPY => "R_X86_64_COPY",
        object::elf::R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        object::elf::R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        object::elf::R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        object::elf::R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        object::elf::R_X86_64_32 => "R_X86_64_32",
        object::elf::R_X86_64_32S => "R_X86_64_32S",
        object::elf::R_X86_64_16 => "R_X86_64_16",
        object::elf::R_X86_64_PC16 => "R_X86_64_PC16",
        object::elf::R_X86_64_8 => "R_X86_64_8",
        object::elf::R_X86_64_PC8 => "R_X86_64_PC8",
        object::elf::R_X86_64_PC64 => "R_X86_64_PC64",
        object::elf::R_X86_64_GOTTPOFF => "R_X86_64_GOTTPOFF",
        object::elf::R_X86_64_TPOFF32 => "R_X86_64_TPOFF32",
        object::elf::R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        object::elf::R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
        object::elf::R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
        object::elf::R_X86_64_TLSGD => "R_X86_64_TLSGD",
        object::elf::R_X86_64_TLSLD => "R_X86_64_TLSLD",
        _ => return Cow::Owned(format!("unknown relocation ({r_type})")),
    };
    Cow::Borrowed(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plt_entry_encodes_rip_relative_jump() {
        let mut entry = [0u8; 16];
        // GOTPLT slot 0x404018, PLT entry 0x401020: disp = 0x404018 - 0x401026.
        write_plt_entry(&mut entry, 0x404018, 0x401020).unwrap();
        assert_eq!(&entry[..2], &[0xff, 0x25]);
        assert_eq!(i32::from_le_bytes(entry[2..6].try_into().unwrap()), 0x2ff2);
        assert!(entry[6..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn classification() {
        assert_eq!(
            relocation_needs(object::elf::R_X86_64_PLT32).unwrap(),
            NEEDS_PLT
        );
        assert_eq!(
            relocation_needs(object::elf::R_X86_64_GOTPCREL).unwrap(),
            NEEDS_GOT
        );
        assert_eq!(
            relocation_needs(object::elf::R_X86_64_GOTTPOFF).unwrap(),
            NEEDS_GOTTP
        );
        assert_eq!(relocation_needs(object::elf::R_X86_64_PC32).unwrap(), 0);
        assert!(relocation_needs(object::elf::R_X86_64_TLSGD).is_err());
    }

    #[test]
    fn pc32_application() {
        let mut out = [0u8; 4];
        let target = RelocationTarget {
            address: 0x401100,
            ..Default::default()
        };
        apply_relocation(
            &mut out,
            object::elf::R_X86_64_PC32,
            &target,
            -4,
            0x401050,
            0,
        )
        .unwrap();
        assert_eq!(i32::from_le_bytes(out), 0xac);
    }

    #[test]
    fn undef_weak_resolves_to_zero() {
        let mut out = [0xffu8; 8];
        let target = RelocationTarget {
            undef_weak: true,
            ..Default::default()
        };
        apply_relocation(&mut out, object::elf::R_X86_64_64, &target, 5, 0, 0).unwrap();
        assert_eq!(out, [0; 8]);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let mut out = [0u8; 4];
        let target = RelocationTarget {
            address: 0x1_0000_0000,
            ..Default::default()
        };
        assert!(
            apply_relocation(&mut out, object::elf::R_X86_64_32, &target, 0, 0, 0).is_err()
        );
    }
}
