//! Control and status registers
//!
//! The handler generator reads and writes CSRs by name. This file
//! maps the names of the CSRs the generator touches to their 12-bit
//! addresses (privileged spec v20211203, chapter 2), and lists the
//! register fields the generator modifies by name.
//!
//! Only the registers used by trap handling, PMP, address translation,
//! floating point and vector state setup are present. A lookup of any
//! other name returns None.

const CSRS: &[(&str, u16)] = &[
    // Unprivileged
    ("fcsr", 0x003),
    ("vstart", 0x008),
    ("vl", 0xc20),
    ("vtype", 0xc21),
    ("vlenb", 0xc22),
    // Supervisor
    ("sstatus", 0x100),
    ("sie", 0x104),
    ("stvec", 0x105),
    ("sscratch", 0x140),
    ("sepc", 0x141),
    ("scause", 0x142),
    ("stval", 0x143),
    ("sip", 0x144),
    ("satp", 0x180),
    // Machine
    ("mstatus", 0x300),
    ("misa", 0x301),
    ("medeleg", 0x302),
    ("mideleg", 0x303),
    ("mie", 0x304),
    ("mtvec", 0x305),
    ("mscratch", 0x340),
    ("mepc", 0x341),
    ("mcause", 0x342),
    ("mtval", 0x343),
    ("mip", 0x344),
    ("pmpcfg0", 0x3a0),
    ("pmpcfg2", 0x3a2),
    ("pmpaddr0", 0x3b0),
    ("pmpaddr1", 0x3b1),
    ("pmpaddr2", 0x3b2),
    ("pmpaddr3", 0x3b3),
    ("pmpaddr4", 0x3b4),
    ("pmpaddr5", 0x3b5),
    ("pmpaddr6", 0x3b6),
    ("pmpaddr7", 0x3b7),
    ("pmpaddr8", 0x3b8),
    ("pmpaddr9", 0x3b9),
    ("pmpaddr10", 0x3ba),
    ("pmpaddr11", 0x3bb),
    ("pmpaddr12", 0x3bc),
    ("pmpaddr13", 0x3bd),
    ("pmpaddr14", 0x3be),
    ("pmpaddr15", 0x3bf),
    ("mhartid", 0xf14),
];

/// Named fields as (register, field, mask)
const FIELDS: &[(&str, &str, u64)] = &[
    ("mstatus", "SIE", 1 << 1),
    ("mstatus", "MIE", 1 << 3),
    ("mstatus", "SPIE", 1 << 5),
    ("mstatus", "MPIE", 1 << 7),
    ("mstatus", "SPP", 1 << 8),
    ("mstatus", "MPP", 0b11 << 11),
    ("mstatus", "MPRV", 1 << 17),
    ("mstatus", "SUM", 1 << 18),
    ("mstatus", "MXR", 1 << 19),
    ("sstatus", "SIE", 1 << 1),
    ("sstatus", "SPIE", 1 << 5),
    ("sstatus", "SPP", 1 << 8),
    ("sstatus", "SUM", 1 << 18),
    ("sstatus", "MXR", 1 << 19),
    ("satp", "PPN", (1 << 44) - 1),
    ("satp", "ASID", 0xffff << 44),
    ("satp", "MODE", 0xf << 60),
    ("mtvec", "MODE", 0b11),
    ("mtvec", "BASE", !0b11),
    ("stvec", "MODE", 0b11),
    ("stvec", "BASE", !0b11),
    ("vtype", "VLMUL", 0b111),
    ("vtype", "VSEW", 0b111 << 3),
    ("vtype", "VTA", 1 << 6),
    ("vtype", "VMA", 1 << 7),
    ("vtype", "VILL", 1 << 63),
];

/// satp.MODE encodings
pub const SATP_MODE_SV39: u64 = 8;
pub const SATP_MODE_SV48: u64 = 9;

/// Low bits of xtvec selecting vectored interrupt mode
pub const TVEC_MODE_VECTORED: u64 = 1;

/// Address of the CSR with the given name
pub fn csr_address(name: &str) -> Option<u16> {
    CSRS.iter()
        .find(|(csr_name, _)| *csr_name == name)
        .map(|&(_, addr)| addr)
}

/// Name of the CSR at the given address
pub fn csr_name(addr: u16) -> Option<&'static str> {
    CSRS.iter()
        .find(|(_, csr_addr)| *csr_addr == addr)
        .map(|&(name, _)| name)
}

/// Combined mask of the named fields of a register. Returns None if
/// any field is unknown.
pub fn field_mask(register: &str, fields: &[&str]) -> Option<u64> {
    fields.iter().try_fold(0, |acc, field| {
        FIELDS
            .iter()
            .find(|(reg, name, _)| *reg == register && name == field)
            .map(|&(_, _, mask)| acc | mask)
    })
}

/// The pmpcfg register holding the configuration byte of a PMP
/// entry, and the bit position of that byte (RV64 packs eight
/// entries per even-numbered pmpcfg register).
pub fn pmpcfg_location(entry: u32) -> (&'static str, u32) {
    let name = if entry < 8 { "pmpcfg0" } else { "pmpcfg2" };
    (name, (entry % 8) * 8)
}

pub fn pmpaddr_name(entry: u32) -> String {
    format!("pmpaddr{entry}")
}
