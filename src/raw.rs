//! Bit-exact ELF32 little-endian record shapes.
//!
//! These mirror the teacher crate's `FromReader`/`ToWriter`/`HasWrittenSize`
//! idiom, but without its const-generic class/encoding parameters: this
//! rewriter only ever speaks ELF32 little-endian, so every record here reads
//! and writes exactly one fixed byte layout.

use std::io::{Read, Write};

use crate::consts::EI_NIDENT;
use crate::error::Result;

/// Decode an owned instance of a type from a little-endian byte reader
pub trait FromReader: Sized {
    /// Decode one instance, advancing `reader` by exactly [`HasWrittenSize::SIZE`] bytes
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self>;
}

/// Encode an instance of a type to a little-endian byte writer
pub trait ToWriter {
    /// Encode this instance, writing exactly [`HasWrittenSize::SIZE`] bytes
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/// A type whose on-disk representation has a fixed, known size
pub trait HasWrittenSize {
    /// The size in bytes when written
    const SIZE: usize;
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    Ok(read_u32(reader)? as i32)
}

/// The ELF file header (`Ehdr`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ehdr {
    /// Magic number and identification bytes
    pub e_ident: [u8; EI_NIDENT],
    /// Object file type
    pub e_type: u16,
    /// Architecture
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u32,
    /// Program header table file offset
    pub e_phoff: u32,
    /// Section header table file offset
    pub e_shoff: u32,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size in bytes
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section header string table index
    pub e_shstrndx: u16,
}

impl HasWrittenSize for Ehdr {
    const SIZE: usize = 52;
}

impl FromReader for Ehdr {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut e_ident = [0u8; EI_NIDENT];
        reader.read_exact(&mut e_ident)?;
        Ok(Self {
            e_ident,
            e_type: read_u16(reader)?,
            e_machine: read_u16(reader)?,
            e_version: read_u32(reader)?,
            e_entry: read_u32(reader)?,
            e_phoff: read_u32(reader)?,
            e_shoff: read_u32(reader)?,
            e_flags: read_u32(reader)?,
            e_ehsize: read_u16(reader)?,
            e_phentsize: read_u16(reader)?,
            e_phnum: read_u16(reader)?,
            e_shentsize: read_u16(reader)?,
            e_shnum: read_u16(reader)?,
            e_shstrndx: read_u16(reader)?,
        })
    }
}

impl ToWriter for Ehdr {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.e_ident)?;
        writer.write_all(&self.e_type.to_le_bytes())?;
        writer.write_all(&self.e_machine.to_le_bytes())?;
        writer.write_all(&self.e_version.to_le_bytes())?;
        writer.write_all(&self.e_entry.to_le_bytes())?;
        writer.write_all(&self.e_phoff.to_le_bytes())?;
        writer.write_all(&self.e_shoff.to_le_bytes())?;
        writer.write_all(&self.e_flags.to_le_bytes())?;
        writer.write_all(&self.e_ehsize.to_le_bytes())?;
        writer.write_all(&self.e_phentsize.to_le_bytes())?;
        writer.write_all(&self.e_phnum.to_le_bytes())?;
        writer.write_all(&self.e_shentsize.to_le_bytes())?;
        writer.write_all(&self.e_shnum.to_le_bytes())?;
        writer.write_all(&self.e_shstrndx.to_le_bytes())?;
        Ok(())
    }
}

/// The section header (`Shdr`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shdr {
    /// Section name (string table index)
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub sh_flags: u32,
    /// Section virtual address at execution
    pub sh_addr: u32,
    /// Section file offset
    pub sh_offset: u32,
    /// Section size in bytes
    pub sh_size: u32,
    /// Link to another section
    pub sh_link: u32,
    /// Additional section information
    pub sh_info: u32,
    /// Section alignment
    pub sh_addralign: u32,
    /// Entry size if section holds a table
    pub sh_entsize: u32,
}

impl HasWrittenSize for Shdr {
    const SIZE: usize = 40;
}

impl FromReader for Shdr {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            sh_name: read_u32(reader)?,
            sh_type: read_u32(reader)?,
            sh_flags: read_u32(reader)?,
            sh_addr: read_u32(reader)?,
            sh_offset: read_u32(reader)?,
            sh_size: read_u32(reader)?,
            sh_link: read_u32(reader)?,
            sh_info: read_u32(reader)?,
            sh_addralign: read_u32(reader)?,
            sh_entsize: read_u32(reader)?,
        })
    }
}

impl ToWriter for Shdr {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.sh_name.to_le_bytes())?;
        writer.write_all(&self.sh_type.to_le_bytes())?;
        writer.write_all(&self.sh_flags.to_le_bytes())?;
        writer.write_all(&self.sh_addr.to_le_bytes())?;
        writer.write_all(&self.sh_offset.to_le_bytes())?;
        writer.write_all(&self.sh_size.to_le_bytes())?;
        writer.write_all(&self.sh_link.to_le_bytes())?;
        writer.write_all(&self.sh_info.to_le_bytes())?;
        writer.write_all(&self.sh_addralign.to_le_bytes())?;
        writer.write_all(&self.sh_entsize.to_le_bytes())?;
        Ok(())
    }
}

/// The program segment header (`Phdr`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Phdr {
    /// Segment type
    pub p_type: u32,
    /// Segment file offset
    pub p_offset: u32,
    /// Segment virtual address
    pub p_vaddr: u32,
    /// Segment physical address
    pub p_paddr: u32,
    /// Segment size in file
    pub p_filesz: u32,
    /// Segment size in memory
    pub p_memsz: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment alignment
    pub p_align: u32,
}

impl HasWrittenSize for Phdr {
    const SIZE: usize = 32;
}

impl FromReader for Phdr {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            p_type: read_u32(reader)?,
            p_offset: read_u32(reader)?,
            p_vaddr: read_u32(reader)?,
            p_paddr: read_u32(reader)?,
            p_filesz: read_u32(reader)?,
            p_memsz: read_u32(reader)?,
            p_flags: read_u32(reader)?,
            p_align: read_u32(reader)?,
        })
    }
}

impl ToWriter for Phdr {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.p_type.to_le_bytes())?;
        writer.write_all(&self.p_offset.to_le_bytes())?;
        writer.write_all(&self.p_vaddr.to_le_bytes())?;
        writer.write_all(&self.p_paddr.to_le_bytes())?;
        writer.write_all(&self.p_filesz.to_le_bytes())?;
        writer.write_all(&self.p_memsz.to_le_bytes())?;
        writer.write_all(&self.p_flags.to_le_bytes())?;
        writer.write_all(&self.p_align.to_le_bytes())?;
        Ok(())
    }
}

/// A symbol table entry (`Sym`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sym {
    /// Symbol name (string table index)
    pub st_name: u32,
    /// Symbol value
    pub st_value: u32,
    /// Symbol size
    pub st_size: u32,
    /// Symbol type and binding, packed
    pub st_info: u8,
    /// Symbol visibility
    pub st_other: u8,
    /// Section index
    pub st_shndx: u16,
}

impl HasWrittenSize for Sym {
    const SIZE: usize = 16;
}

impl FromReader for Sym {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            st_name: read_u32(reader)?,
            st_value: read_u32(reader)?,
            st_size: read_u32(reader)?,
            st_info: read_u8(reader)?,
            st_other: read_u8(reader)?,
            st_shndx: read_u16(reader)?,
        })
    }
}

impl ToWriter for Sym {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.st_name.to_le_bytes())?;
        writer.write_all(&self.st_value.to_le_bytes())?;
        writer.write_all(&self.st_size.to_le_bytes())?;
        writer.write_all(&[self.st_info, self.st_other])?;
        writer.write_all(&self.st_shndx.to_le_bytes())?;
        Ok(())
    }
}

/// A relocation entry without an explicit addend (`Rel`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rel {
    /// Address
    pub r_offset: u32,
    /// Relocation type and symbol index, packed
    pub r_info: u32,
}

impl HasWrittenSize for Rel {
    const SIZE: usize = 8;
}

impl FromReader for Rel {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            r_offset: read_u32(reader)?,
            r_info: read_u32(reader)?,
        })
    }
}

impl ToWriter for Rel {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.r_offset.to_le_bytes())?;
        writer.write_all(&self.r_info.to_le_bytes())?;
        Ok(())
    }
}

/// A relocation entry with an explicit addend (`Rela`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rela {
    /// Address
    pub r_offset: u32,
    /// Relocation type and symbol index, packed
    pub r_info: u32,
    /// Addend
    pub r_addend: i32,
}

impl HasWrittenSize for Rela {
    const SIZE: usize = 12;
}

impl FromReader for Rela {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            r_offset: read_u32(reader)?,
            r_info: read_u32(reader)?,
            r_addend: read_i32(reader)?,
        })
    }
}

impl ToWriter for Rela {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.r_offset.to_le_bytes())?;
        writer.write_all(&self.r_info.to_le_bytes())?;
        writer.write_all(&self.r_addend.to_le_bytes())?;
        Ok(())
    }
}

/// A dynamic section entry (`Dyn`). `d_un` is modeled as a single `u32`
/// since the union's two arms (`d_val`, `d_ptr`) share identical layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dyn {
    /// Dynamic entry type (`DT_*`)
    pub d_tag: i32,
    /// Integer or address value
    pub d_un: u32,
}

impl HasWrittenSize for Dyn {
    const SIZE: usize = 8;
}

impl FromReader for Dyn {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            d_tag: read_i32(reader)?,
            d_un: read_u32(reader)?,
        })
    }
}

impl ToWriter for Dyn {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.d_tag.to_le_bytes())?;
        writer.write_all(&self.d_un.to_le_bytes())?;
        Ok(())
    }
}
