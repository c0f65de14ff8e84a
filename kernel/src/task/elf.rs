//! ELF64 parsing and program loading.
//!
//! Validates and parses an in-memory ELF image, then loads its LOAD
//! segments into a target address space: fresh frames per segment, zeroed,
//! file bytes copied through the direct map, mapped with flags derived from
//! the segment's R/W/X bits. Shared objects are relocated by a caller-given
//! base. Unloading walks each segment, unmaps its pages and frees each
//! contiguous backing run once.

use crate::fs::{FileSystem, O_RDONLY};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::{physical, virtual_mem, FRAME_SIZE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// `e_ident` indices.
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// Object types accepted by the loader.
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const EM_X86_64: u16 = 0x3E;

const PT_LOAD: u32 = 1;

/// Segment permission bits.
const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;

/// Canonical on-disk entry sizes for ELF64.
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;

/// ELF64 file header (64 bytes, packed to match the on-disk format).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF64 program header (56 bytes, packed to match the on-disk format).
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// A validated ELF64 image over a byte buffer.
#[derive(Debug)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

/// One loaded segment: the page-aligned range and its contiguous backing.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub pages: usize,
    pub phys: PhysAddr,
}

const EMPTY_SEGMENT: Segment = Segment { vaddr: 0, pages: 0, phys: PhysAddr::new(0) };

/// Upper bound on LOAD segments per image.
pub const MAX_SEGMENTS: usize = 8;

/// Result of loading an image into an address space.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Effective entry point (`e_entry`, base-adjusted for shared objects).
    pub entry: u64,
    /// Highest `vaddr + memsz` over all LOAD segments.
    pub top: u64,
    segments: [Segment; MAX_SEGMENTS],
    count: usize,
}

impl LoadedImage {
    pub const fn empty() -> Self {
        LoadedImage { entry: 0, top: 0, segments: [EMPTY_SEGMENT; MAX_SEGMENTS], count: 0 }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.count]
    }

    pub fn is_loaded(&self) -> bool {
        self.count > 0
    }
}

impl<'a> ElfFile<'a> {
    /// Validate and parse an ELF64 image from a byte buffer.
    ///
    /// Rejects anything that is not a little-endian x86-64 executable or
    /// shared object with canonical header entry sizes, or whose header
    /// tables extend past the buffer.
    pub fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < core::mem::size_of::<Elf64Header>() {
            return Err("ELF buffer too small");
        }

        let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

        if header.e_ident[..4] != ELF_MAGIC {
            return Err("invalid ELF magic");
        }
        if header.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err("not a 64-bit ELF");
        }
        if header.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err("not little-endian");
        }
        if header.e_machine != EM_X86_64 {
            return Err("not an x86_64 ELF");
        }
        if header.e_type != ET_EXEC && header.e_type != ET_DYN {
            return Err("not an executable or shared object");
        }
        if header.e_phnum > 0 && header.e_phentsize as usize != PHDR_SIZE {
            return Err("invalid program header size");
        }
        if header.e_shnum > 0 && header.e_shentsize as usize != SHDR_SIZE {
            return Err("invalid section header size");
        }

        let ph_end = (header.e_phoff as usize).checked_add(header.e_phnum as usize * PHDR_SIZE);
        if header.e_phnum > 0 && ph_end.map_or(true, |end| end > data.len()) {
            return Err("program headers outside file bounds");
        }
        let sh_end = (header.e_shoff as usize).checked_add(header.e_shnum as usize * SHDR_SIZE);
        if header.e_shnum > 0 && sh_end.map_or(true, |end| end > data.len()) {
            return Err("section headers outside file bounds");
        }

        Ok(ElfFile { data, header })
    }

    /// `true` for shared objects (relocated by a load base).
    pub fn is_shared_object(&self) -> bool {
        self.header.e_type == ET_DYN
    }

    /// Raw entry point from the header.
    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    /// Effective entry point for the given load base.
    pub fn entry_at(&self, base: u64) -> u64 {
        if self.is_shared_object() {
            self.header.e_entry + base
        } else {
            self.header.e_entry
        }
    }

    pub fn program_header_count(&self) -> usize {
        self.header.e_phnum as usize
    }

    fn program_header(&self, index: usize) -> Elf64Phdr {
        let offset = self.header.e_phoff as usize + index * PHDR_SIZE;
        unsafe { core::ptr::read_unaligned(self.data.as_ptr().add(offset) as *const Elf64Phdr) }
    }

    /// Load every LOAD segment into `space` and return the image record.
    ///
    /// For each segment: `ceil(memsz / 4096)` fresh frames are allocated in
    /// one contiguous run, zeroed, filled with `filesz` bytes from the
    /// buffer, and mapped at the page-rounded virtual address with
    /// writable/no-execute flags derived from the segment bits. Any failure
    /// unwinds everything loaded so far.
    pub fn load(&self, space: &virtual_mem::AddressSpace, base: u64) -> Result<LoadedImage, &'static str> {
        let mut image = LoadedImage::empty();
        image.entry = self.entry_at(base);

        for i in 0..self.program_header_count() {
            let phdr = self.program_header(i);
            if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
                continue;
            }

            let vaddr = if self.is_shared_object() {
                match phdr.p_vaddr.checked_add(base) {
                    Some(v) => v,
                    None => {
                        unload(space, &image);
                        return Err("segment address overflow");
                    }
                }
            } else {
                phdr.p_vaddr
            };
            let memsz = phdr.p_memsz;
            let filesz = phdr.p_filesz as usize;
            let offset = phdr.p_offset as usize;

            // Header fields are untrusted: checked sums so a wrapping
            // offset cannot slip an out-of-bounds read past this test.
            let file_end = match offset.checked_add(filesz) {
                Some(end) => end,
                None => {
                    unload(space, &image);
                    return Err("segment data outside file bounds");
                }
            };
            if filesz > 0 && file_end > self.data.len() {
                unload(space, &image);
                return Err("segment data outside file bounds");
            }
            if !VirtAddr::new(vaddr).is_user() {
                unload(space, &image);
                return Err("segment outside user space");
            }
            if image.count == MAX_SEGMENTS {
                unload(space, &image);
                return Err("too many LOAD segments");
            }

            let page_vaddr = vaddr & !(FRAME_SIZE as u64 - 1);
            let span = match (vaddr - page_vaddr).checked_add(memsz) {
                Some(span) => span,
                None => {
                    unload(space, &image);
                    return Err("segment size overflow");
                }
            };
            let pages = match span.checked_add(FRAME_SIZE as u64 - 1) {
                Some(rounded) => (rounded / FRAME_SIZE as u64) as usize,
                None => {
                    unload(space, &image);
                    return Err("segment size overflow");
                }
            };

            let phys = match physical::alloc_frames(pages) {
                Some(p) => p,
                None => {
                    unload(space, &image);
                    return Err("out of frames for segment");
                }
            };

            // Zero the run, then copy file bytes at the in-page offset.
            unsafe {
                let dst = virtual_mem::phys_to_virt(phys);
                core::ptr::write_bytes(dst, 0, pages * FRAME_SIZE);
                if filesz > 0 {
                    core::ptr::copy_nonoverlapping(
                        self.data.as_ptr().add(offset),
                        dst.add((vaddr - page_vaddr) as usize),
                        filesz,
                    );
                }
            }

            let mut flags = virtual_mem::FLAG_USER;
            if phdr.p_flags & PF_W != 0 {
                flags |= virtual_mem::FLAG_WRITABLE;
            }
            if phdr.p_flags & PF_X == 0 {
                flags |= virtual_mem::FLAG_NO_EXECUTE;
            }

            if !virtual_mem::map_pages_in(space, VirtAddr::new(page_vaddr), phys, pages, flags) {
                physical::free_frames(phys, pages);
                unload(space, &image);
                return Err("failed to map segment");
            }

            image.segments[image.count] = Segment { vaddr: page_vaddr, pages, phys };
            image.count += 1;

            let segment_end = vaddr + memsz;
            if segment_end > image.top {
                image.top = segment_end;
            }

            let p_flags = phdr.p_flags;
            crate::log_debug!(
                "ELF: segment {} at {:#x} ({} pages, flags {:#x})",
                i, page_vaddr, pages, p_flags
            );
        }

        crate::log_info!(
            "ELF: loaded {} segments, entry {:#x}, top {:#x}",
            image.count, image.entry, image.top
        );
        Ok(image)
    }
}

/// Unload an image from `space`: unmap every segment page and free each
/// contiguous backing run exactly once.
pub fn unload(space: &virtual_mem::AddressSpace, image: &LoadedImage) {
    for segment in image.segments() {
        virtual_mem::unmap_pages_in(space, VirtAddr::new(segment.vaddr), segment.pages);
        physical::free_frames(segment.phys, segment.pages);
    }
}

/// A file read into physically contiguous frames, addressable through the
/// direct map.
pub struct FileBuffer {
    phys: PhysAddr,
    pages: usize,
    len: usize,
}

impl FileBuffer {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(virtual_mem::phys_to_virt(self.phys), self.len) }
    }

    /// Return the backing frames to the allocator.
    pub fn free(self) {
        physical::free_frames(self.phys, self.pages);
    }
}

/// Read chunk size for the file-backed entry point.
const READ_CHUNK: usize = 64 * 1024;

/// File-backed entry point: read `path` through the filesystem collaborator
/// into a frame-backed buffer. The buffer grows in 64 KiB steps.
pub fn read_file(fs: &mut dyn FileSystem, path: &str) -> Result<FileBuffer, &'static str> {
    let fd = fs.open(path, O_RDONLY);
    if fd < 0 {
        return Err("failed to open file");
    }

    let mut capacity = READ_CHUNK;
    let mut pages = capacity / FRAME_SIZE;
    let mut phys = match physical::alloc_frames(pages) {
        Some(p) => p,
        None => {
            fs.close(fd);
            return Err("out of frames for file buffer");
        }
    };

    let mut total = 0usize;
    loop {
        let buf = unsafe {
            core::slice::from_raw_parts_mut(
                virtual_mem::phys_to_virt(phys).add(total),
                capacity - total,
            )
        };
        let n = fs.read(fd, buf);
        if n < 0 {
            fs.close(fd);
            physical::free_frames(phys, pages);
            return Err("read error");
        }
        if n == 0 {
            break;
        }
        total += n as usize;

        if total == capacity {
            // Grow: allocate a larger run, copy, release the old one.
            let new_capacity = capacity + READ_CHUNK;
            let new_pages = new_capacity / FRAME_SIZE;
            let new_phys = match physical::alloc_frames(new_pages) {
                Some(p) => p,
                None => {
                    fs.close(fd);
                    physical::free_frames(phys, pages);
                    return Err("out of frames growing file buffer");
                }
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    virtual_mem::phys_to_virt(phys),
                    virtual_mem::phys_to_virt(new_phys),
                    total,
                );
            }
            physical::free_frames(phys, pages);
            phys = new_phys;
            pages = new_pages;
            capacity = new_capacity;
        }
    }

    fs.close(fd);
    if total == 0 {
        physical::free_frames(phys, pages);
        return Err("file is empty");
    }
    Ok(FileBuffer { phys, pages, len: total })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal valid ELF64 header with `phnum` program headers.
    fn minimal_elf(class: u8, data_enc: u8, machine: u16, e_type: u16, phnum: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 64 + phnum as usize * PHDR_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[EI_CLASS] = class;
        buf[EI_DATA] = data_enc;
        buf[6] = 1; // EI_VERSION
        buf[16..18].copy_from_slice(&e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&machine.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        buf[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // e_entry
        if phnum > 0 {
            buf[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
            buf[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
            buf[56..58].copy_from_slice(&phnum.to_le_bytes());
        }
        buf[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        buf
    }

    fn valid_exec() -> Vec<u8> {
        minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 0)
    }

    #[test]
    fn parses_valid_executable() {
        let buf = valid_exec();
        let elf = ElfFile::parse(&buf).unwrap();
        assert_eq!(elf.entry(), 0x40_0000);
        assert!(!elf.is_shared_object());
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert!(ElfFile::parse(&[0x7F, b'E', b'L', b'F']).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = valid_exec();
        buf[0] = 0x7E;
        assert!(ElfFile::parse(&buf).is_err());
    }

    #[test]
    fn rejects_elf32_class() {
        // Correct magic but 32-bit class byte: parse fails, nothing mapped.
        let buf = minimal_elf(1, ELFDATA2LSB, EM_X86_64, ET_EXEC, 0);
        assert_eq!(ElfFile::parse(&buf).unwrap_err(), "not a 64-bit ELF");
    }

    #[test]
    fn rejects_big_endian() {
        let buf = minimal_elf(ELFCLASS64, 2, EM_X86_64, ET_EXEC, 0);
        assert_eq!(ElfFile::parse(&buf).unwrap_err(), "not little-endian");
    }

    #[test]
    fn rejects_wrong_machine() {
        let buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, 0x28 /* ARM */, ET_EXEC, 0);
        assert_eq!(ElfFile::parse(&buf).unwrap_err(), "not an x86_64 ELF");
    }

    #[test]
    fn rejects_relocatable_object() {
        let buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, 1 /* ET_REL */, 0);
        assert!(ElfFile::parse(&buf).is_err());
    }

    #[test]
    fn rejects_noncanonical_phentsize() {
        let mut buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 1);
        buf[54..56].copy_from_slice(&40u16.to_le_bytes());
        assert_eq!(ElfFile::parse(&buf).unwrap_err(), "invalid program header size");
    }

    #[test]
    fn rejects_wrapping_phdr_table_offset() {
        // e_phoff near usize::MAX: the table-end sum must not wrap past
        // the bounds check.
        let mut buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 1);
        buf[32..40].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
        assert_eq!(
            ElfFile::parse(&buf).unwrap_err(),
            "program headers outside file bounds"
        );
    }

    #[test]
    fn rejects_wrapping_segment_offset() {
        // p_offset + p_filesz wraps to a small value; the loader must
        // reject the segment instead of reading out of bounds.
        let mut buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 1);
        let p = 64;
        buf[p..p + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[p + 8..p + 16].copy_from_slice(&(u64::MAX - 8).to_le_bytes()); // p_offset
        buf[p + 16..p + 24].copy_from_slice(&0x40_0000u64.to_le_bytes()); // p_vaddr
        buf[p + 32..p + 40].copy_from_slice(&0x100u64.to_le_bytes()); // p_filesz
        buf[p + 40..p + 48].copy_from_slice(&0x1000u64.to_le_bytes()); // p_memsz

        let elf = ElfFile::parse(&buf).unwrap();
        // Rejected before any frame is allocated or page mapped.
        let space = virtual_mem::AddressSpace::from_cr3(0x1000);
        assert_eq!(
            elf.load(&space, 0).unwrap_err(),
            "segment data outside file bounds"
        );
    }

    #[test]
    fn rejects_wrapping_segment_size() {
        // p_memsz so large the page-span arithmetic would wrap.
        let mut buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 1);
        let p = 64;
        buf[p..p + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[p + 16..p + 24].copy_from_slice(&0x40_0010u64.to_le_bytes()); // p_vaddr
        buf[p + 40..p + 48].copy_from_slice(&u64::MAX.to_le_bytes()); // p_memsz

        let elf = ElfFile::parse(&buf).unwrap();
        let space = virtual_mem::AddressSpace::from_cr3(0x1000);
        assert_eq!(elf.load(&space, 0).unwrap_err(), "segment size overflow");
    }

    #[test]
    fn rejects_phdr_table_past_buffer() {
        let mut buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 1);
        buf.truncate(64 + PHDR_SIZE - 1);
        assert_eq!(
            ElfFile::parse(&buf).unwrap_err(),
            "program headers outside file bounds"
        );
    }

    #[test]
    fn shared_object_entry_is_base_adjusted() {
        let buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_DYN, 0);
        let elf = ElfFile::parse(&buf).unwrap();
        assert!(elf.is_shared_object());
        assert_eq!(elf.entry_at(0x7000_0000), 0x7040_0000);
        // Executables ignore the base.
        let buf = valid_exec();
        let elf = ElfFile::parse(&buf).unwrap();
        assert_eq!(elf.entry_at(0x7000_0000), 0x40_0000);
    }

    #[test]
    fn program_headers_round_trip() {
        let mut buf = minimal_elf(ELFCLASS64, ELFDATA2LSB, EM_X86_64, ET_EXEC, 1);
        let phdr_off = 64;
        buf[phdr_off..phdr_off + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[phdr_off + 4..phdr_off + 8].copy_from_slice(&(PF_X | 4).to_le_bytes());
        buf[phdr_off + 16..phdr_off + 24].copy_from_slice(&0x40_0000u64.to_le_bytes()); // p_vaddr
        buf[phdr_off + 32..phdr_off + 40].copy_from_slice(&0x123u64.to_le_bytes()); // p_filesz
        buf[phdr_off + 40..phdr_off + 48].copy_from_slice(&0x1000u64.to_le_bytes()); // p_memsz

        let elf = ElfFile::parse(&buf).unwrap();
        assert_eq!(elf.program_header_count(), 1);
        let phdr = elf.program_header(0);
        assert_eq!({ phdr.p_type }, PT_LOAD);
        assert_eq!({ phdr.p_vaddr }, 0x40_0000);
        assert_eq!({ phdr.p_filesz }, 0x123);
        assert_eq!({ phdr.p_memsz }, 0x1000);
    }

    #[test]
    fn empty_image_reports_not_loaded() {
        let image = LoadedImage::empty();
        assert!(!image.is_loaded());
        assert!(image.segments().is_empty());
    }
}
