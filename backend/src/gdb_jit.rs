//! GDB JIT interface: publish the generated code buffer to an
//! attached debugger as a synthetic ELF image.
//!
//! GDB (since 7.0) looks for a global `__jit_debug_descriptor` and
//! calls `__jit_debug_register_code` as a breakpoint whenever a new
//! entry is registered. The image content never needs to be real
//! object code — `.text` is marked `NOBITS` and just describes the
//! address range already occupied by the JIT buffer.
//!
//! Reference: `tcg/tcg.c` (`tcg_register_jit_int`, `ELF_HOST_MACHINE`
//! path), upstream in `~/qemu/tcg/tcg.c`.

use std::sync::Mutex;

const EI_NIDENT: usize = 16;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;

const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;

const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;

const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
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

#[repr(C)]
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

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

/// `DW_TAG_compile_unit` + `DW_TAG_subprogram` pair, just enough for
/// GDB to resolve a `low_pc..high_pc` range to the symbol name.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct DebugInfo {
    len: u32,
    version: u16,
    abbrev: u32,
    ptr_size: u8,
    cu_die: u8,
    cu_lang: u16,
    cu_low_pc: u64,
    cu_high_pc: u64,
    fn_die: u8,
    fn_name: [u8; 16],
    fn_low_pc: u64,
    fn_high_pc: u64,
    cu_eoc: u8,
}

// String table offsets. Computed by hand for the fixed layout below
// rather than scanned at runtime (`find_string` in the C original) —
// the table is a compile-time constant, so the offsets are too.
const STR_TEXT: u32 = 1;
const STR_DEBUG_INFO: u32 = 7;
const STR_DEBUG_ABBREV: u32 = 19;
const STR_DEBUG_FRAME: u32 = 33;
const STR_SYMTAB: u32 = 46;
const STR_STRTAB: u32 = 54;
const STR_CODE_GEN_BUFFER: u32 = 62;

const STRTAB: &[u8] = b"\0.text\0.debug_info\0.debug_abbrev\0.debug_frame\0.symtab\0.strtab\0code_gen_buffer\0";

// DWARF abbreviation table: abbrev 1 = compile_unit(language, low_pc,
// high_pc), abbrev 2 = subprogram(name, low_pc, high_pc).
const ABBREV: [u8; 23] = [
    1, 0x11, 1, 0x13, 0x5, 0x11, 0x1, 0x12, 0x1, 0, 0, 2, 0x2e, 0, 0x3, 0x8,
    0x11, 0x1, 0x12, 0x1, 0, 0, 0,
];

/// Minimal `.debug_frame` CIE+FDE: no CFI opcodes beyond the default
/// (unwinding through JIT code is not a goal here, only letting GDB
/// recognize and symbolicate the `code_gen_buffer` range). Bytes 24..32
/// and 32..40 (the FDE's `initial_location`/`address_range`) are
/// patched per registration.
pub const DEBUG_FRAME_TEMPLATE: [u8; 40] = [
    // CIE: length=12, id=0xffffffff, version=1, augmentation="",
    // code_align=1, data_align=-8 (sleb128), return_reg=16, pad x3.
    12, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 1, 0, 1, 0x78, 16, 0, 0, 0,
    // FDE: length=20, cie_pointer=0, initial_location=0 (patched),
    // address_range=0 (patched).
    20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[repr(C)]
struct ElfImage {
    ehdr: Elf64Ehdr,
    phdr: Elf64Phdr,
    shdr: [Elf64Shdr; 7],
    sym: [Elf64Sym; 2],
    di: DebugInfo,
    da: [u8; 24],
    str_: [u8; 80],
}

/// GDB JIT interface descriptor. Must match GDB's expected layout and
/// symbol names exactly.
#[repr(C)]
struct JitCodeEntry {
    next_entry: *mut JitCodeEntry,
    prev_entry: *mut JitCodeEntry,
    symfile_addr: *const u8,
    symfile_size: u64,
}

#[repr(C)]
struct JitDescriptor {
    version: u32,
    action_flag: u32,
    relevant_entry: *mut JitCodeEntry,
    first_entry: *mut JitCodeEntry,
}

// SAFETY: access to the raw pointers is serialized by JIT_REGISTRY
// below; GDB only reads this under its own stop-the-world control.
unsafe impl Send for JitDescriptor {}
unsafe impl Send for JitCodeEntry {}

const JIT_NOACTION: u32 = 0;
const JIT_REGISTER_FN: u32 = 1;

#[no_mangle]
#[inline(never)]
pub extern "C" fn __jit_debug_register_code() {
    // A debugger places a breakpoint here; the body is intentionally
    // a no-op observed only by the debugger.
    std::hint::black_box(());
}

#[no_mangle]
static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor {
    version: 1,
    action_flag: JIT_NOACTION,
    relevant_entry: std::ptr::null_mut(),
    first_entry: std::ptr::null_mut(),
};

/// Owns the one `JitCodeEntry` + `ElfImage` allocation this process
/// registers. A real multi-TB-region emulator would keep a list; this
/// backend registers the whole code buffer once at startup, so a
/// single static entry suffices.
static JIT_REGISTRY: Mutex<Option<(Box<JitCodeEntry>, Vec<u8>)>> =
    Mutex::new(None);

fn build_image(buf_ptr: *const u8, buf_size: usize, debug_frame: &[u8]) -> Vec<u8> {
    let buf = buf_ptr as u64;

    let mut img = ElfImage {
        ehdr: Elf64Ehdr {
            e_ident: {
                let mut id = [0u8; EI_NIDENT];
                id[0..4].copy_from_slice(b"\x7fELF");
                id[4] = ELFCLASS64;
                id[5] = ELFDATA2LSB;
                id[6] = EV_CURRENT;
                id
            },
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_version: EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: std::mem::offset_of!(ElfImage, phdr) as u64,
            e_shoff: std::mem::offset_of!(ElfImage, shdr) as u64,
            e_flags: 0,
            e_ehsize: std::mem::size_of::<Elf64Ehdr>() as u16,
            e_phentsize: std::mem::size_of::<Elf64Phdr>() as u16,
            e_phnum: 1,
            e_shentsize: std::mem::size_of::<Elf64Shdr>() as u16,
            e_shnum: 7,
            e_shstrndx: 6,
        },
        phdr: Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: PF_X,
            p_offset: 0,
            p_vaddr: buf,
            p_paddr: buf,
            p_filesz: 0,
            p_memsz: buf_size as u64,
            p_align: 0,
        },
        shdr: [Elf64Shdr {
            sh_name: 0,
            sh_type: SHT_NULL,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0,
            sh_entsize: 0,
        }; 7],
        sym: [Elf64Sym {
            st_name: 0,
            st_info: 0,
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 0,
        }; 2],
        di: DebugInfo {
            len: (std::mem::size_of::<DebugInfo>() - 4) as u32,
            version: 2,
            abbrev: 0,
            ptr_size: 8,
            cu_die: 1,
            cu_lang: 0x8001, // DW_LANG_Mips_Assembler, same placeholder as upstream
            cu_low_pc: buf,
            cu_high_pc: buf + buf_size as u64,
            fn_die: 2,
            fn_name: {
                let mut name = [0u8; 16];
                name[..15].copy_from_slice(b"code_gen_buffer");
                name
            },
            fn_low_pc: buf,
            fn_high_pc: buf + buf_size as u64,
            cu_eoc: 0,
        },
        da: {
            let mut da = [0u8; 24];
            da[..ABBREV.len()].copy_from_slice(&ABBREV);
            da
        },
        str_: {
            let mut s = [0u8; 80];
            s[..STRTAB.len()].copy_from_slice(STRTAB);
            s
        },
    };

    // .text: NOBITS, so no content is ever copied in — the symbol
    // just describes an address range GDB should treat as code.
    img.shdr[1] = Elf64Shdr {
        sh_name: STR_TEXT,
        sh_type: SHT_NOBITS,
        sh_flags: SHF_EXECINSTR | SHF_ALLOC,
        sh_addr: buf,
        sh_offset: 0,
        sh_size: buf_size as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 0,
        sh_entsize: 0,
    };
    img.shdr[2] = Elf64Shdr {
        sh_name: STR_DEBUG_INFO,
        sh_type: SHT_PROGBITS,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: std::mem::offset_of!(ElfImage, di) as u64,
        sh_size: std::mem::size_of::<DebugInfo>() as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 0,
        sh_entsize: 0,
    };
    img.shdr[3] = Elf64Shdr {
        sh_name: STR_DEBUG_ABBREV,
        sh_type: SHT_PROGBITS,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: std::mem::offset_of!(ElfImage, da) as u64,
        sh_size: 24,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 0,
        sh_entsize: 0,
    };
    img.shdr[4] = Elf64Shdr {
        sh_name: STR_DEBUG_FRAME,
        sh_type: SHT_PROGBITS,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: std::mem::size_of::<ElfImage>() as u64,
        sh_size: debug_frame.len() as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 0,
        sh_entsize: 0,
    };
    img.shdr[5] = Elf64Shdr {
        sh_name: STR_SYMTAB,
        sh_type: SHT_SYMTAB,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: std::mem::offset_of!(ElfImage, sym) as u64,
        sh_size: std::mem::size_of::<[Elf64Sym; 2]>() as u64,
        sh_link: 6,
        sh_info: 1,
        sh_addralign: 0,
        sh_entsize: std::mem::size_of::<Elf64Sym>() as u64,
    };
    img.shdr[6] = Elf64Shdr {
        sh_name: STR_STRTAB,
        sh_type: SHT_STRTAB,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: std::mem::offset_of!(ElfImage, str_) as u64,
        sh_size: 80,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 0,
        sh_entsize: 0,
    };

    img.sym[1] = Elf64Sym {
        st_name: STR_CODE_GEN_BUFFER,
        st_info: (STB_GLOBAL << 4) | STT_FUNC,
        st_other: 0,
        st_shndx: 1,
        st_value: buf,
        st_size: buf_size as u64,
    };

    let img_size = std::mem::size_of::<ElfImage>() + debug_frame.len();
    let mut out = vec![0u8; img_size];
    // SAFETY: ElfImage has no padding-sensitive invariants beyond its
    // own repr(C) layout; reading its bytes is sound.
    unsafe {
        let src = std::slice::from_raw_parts(
            &img as *const ElfImage as *const u8,
            std::mem::size_of::<ElfImage>(),
        );
        out[..src.len()].copy_from_slice(src);
    }
    out[std::mem::size_of::<ElfImage>()..].copy_from_slice(debug_frame);
    out
}

/// Publish `[buf_ptr, buf_ptr+buf_size)` to an attached GDB as a
/// synthetic "code_gen_buffer" function, with `debug_frame` (a CIE+FDE
/// template from the host backend) describing unwind info.
///
/// Only one region is ever registered: re-calling replaces the prior
/// registration (matches this backend's single code-buffer model; a
/// multi-buffer JIT would chain `JitCodeEntry::next_entry` instead).
pub fn register_jit(buf_ptr: *const u8, buf_size: usize, debug_frame: &[u8]) {
    let mut frame = debug_frame.to_vec();
    let func_start = (buf_ptr as u64).to_le_bytes();
    let func_len = (buf_size as u64).to_le_bytes();
    let fde_body_off = 16 + 4; // skip CIE (16 bytes) + FDE length + cie_pointer
    frame[fde_body_off..fde_body_off + 8].copy_from_slice(&func_start);
    frame[fde_body_off + 8..fde_body_off + 16].copy_from_slice(&func_len);

    let image = build_image(buf_ptr, buf_size, &frame);

    let mut reg = JIT_REGISTRY.lock().unwrap();
    let mut entry = Box::new(JitCodeEntry {
        next_entry: std::ptr::null_mut(),
        prev_entry: std::ptr::null_mut(),
        symfile_addr: image.as_ptr(),
        symfile_size: image.len() as u64,
    });
    let entry_ptr: *mut JitCodeEntry = &mut *entry;

    // SAFETY: `__jit_debug_descriptor` is only mutated here, under
    // JIT_REGISTRY's lock, and the pointers refer to `entry`/`image`
    // which this function is about to store for the 'static lifetime
    // of the registry.
    unsafe {
        let d = std::ptr::addr_of_mut!(__jit_debug_descriptor);
        (*d).relevant_entry = entry_ptr;
        (*d).first_entry = entry_ptr;
        (*d).action_flag = JIT_REGISTER_FN;
    }
    __jit_debug_register_code();

    *reg = Some((entry, image));
}
