pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_IMM: u32 = 0b0010011;
pub const OP_IMM_32: u32 = 0b0011011;
pub const OP: u32 = 0b0110011;
pub const OP_32: u32 = 0b0111011;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_SYSTEM: u32 = 0b1110011;
pub const OP_FP: u32 = 0b1010011;
pub const OP_V: u32 = 0b1010111;

// Conditional branches
pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

// Load and store widths
pub const FUNCT3_B: u32 = 0b000;
pub const FUNCT3_H: u32 = 0b001;
pub const FUNCT3_W: u32 = 0b010;
pub const FUNCT3_D: u32 = 0b011;

// Register-immediate opcodes
pub const FUNCT3_ADDI: u32 = 0b000;
pub const FUNCT3_SLTI: u32 = 0b010;
pub const FUNCT3_SLTIU: u32 = 0b011;
pub const FUNCT3_XORI: u32 = 0b100;
pub const FUNCT3_ORI: u32 = 0b110;
pub const FUNCT3_ANDI: u32 = 0b111;
pub const FUNCT3_SLLI: u32 = 0b001;
pub const FUNCT3_SRLI: u32 = 0b101;
pub const FUNCT3_SRAI: u32 = 0b101;

// Register-register opcodes
pub const FUNCT3_ADD: u32 = 0b000;
pub const FUNCT3_SUB: u32 = 0b000;
pub const FUNCT3_SLL: u32 = 0b001;
pub const FUNCT3_XOR: u32 = 0b100;
pub const FUNCT3_SRL: u32 = 0b101;
pub const FUNCT3_OR: u32 = 0b110;
pub const FUNCT3_AND: u32 = 0b111;
pub const FUNCT7_SUB: u32 = 0b0100000;
pub const FUNCT7_SRA: u32 = 0b0100000;

// Zicsr
pub const FUNCT3_CSRRW: u32 = 0b001;
pub const FUNCT3_CSRRS: u32 = 0b010;
pub const FUNCT3_CSRRC: u32 = 0b011;

// Privileged instructions (full encodings)
pub const MRET: u32 = 0x3020_0073;
pub const SRET: u32 = 0x1020_0073;
pub const FUNCT7_SFENCE_VMA: u32 = 0b0001001;

// fmv.d.x
pub const FUNCT7_FMV_D_X: u32 = 0b1111001;

// Vector configuration and permutation
pub const FUNCT3_OPCFG: u32 = 0b111;
pub const FUNCT3_OPMVX: u32 = 0b110;
pub const FUNCT7_VSETVL: u32 = 0b1000000;
/// funct6 = 0b001111, vm = 1 (unmasked)
pub const FUNCT7_VSLIDE1DOWN: u32 = 0b0011111;
