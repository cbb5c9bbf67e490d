// The platform's memory-mapped register map. These addresses are part of
// the stable guest ABI; moving one breaks every shipped program.

/// Total bus address space backed by RAM.
pub const RAM_SIZE: usize = 32 << 20;

/// The last megabyte of the address space holds the device register banks.
pub const IO_BASE: u32 = 0x01F0_0000;

// Terminal byte port.
pub const TERM_BASE: u32 = 0x01F0_0000;
pub const TERM_DATA: u32 = TERM_BASE;
pub const TERM_STATUS: u32 = TERM_BASE + 0x04;
pub const TERM_CTRL: u32 = TERM_BASE + 0x08;
pub const TERM_LIMIT: u32 = TERM_BASE + 0x0F;

// File I/O command block.
pub const FILE_BASE: u32 = 0x01F0_0100;
pub const FILE_CMD: u32 = FILE_BASE;
pub const FILE_HANDLE: u32 = FILE_BASE + 0x04;
pub const FILE_NAME_PTR: u32 = FILE_BASE + 0x08;
pub const FILE_BUF_PTR: u32 = FILE_BASE + 0x0C;
pub const FILE_LEN: u32 = FILE_BASE + 0x10;
pub const FILE_SEEK: u32 = FILE_BASE + 0x14;
pub const FILE_STATUS: u32 = FILE_BASE + 0x18;
pub const FILE_RESULT: u32 = FILE_BASE + 0x1C;
pub const FILE_LIMIT: u32 = FILE_BASE + 0x1F;

// Media loader command block: pulls a host file into guest RAM.
pub const MEDIA_BASE: u32 = 0x01F0_0200;
pub const MEDIA_CMD: u32 = MEDIA_BASE;
pub const MEDIA_NAME_PTR: u32 = MEDIA_BASE + 0x04;
pub const MEDIA_DEST: u32 = MEDIA_BASE + 0x08;
pub const MEDIA_STATUS: u32 = MEDIA_BASE + 0x0C;
pub const MEDIA_LEN: u32 = MEDIA_BASE + 0x10;
pub const MEDIA_LIMIT: u32 = MEDIA_BASE + 0x13;

// Program executor command block: reboots the machine into another image.
pub const EXEC_BASE: u32 = 0x01F0_0300;
pub const EXEC_CMD: u32 = EXEC_BASE;
pub const EXEC_NAME_PTR: u32 = EXEC_BASE + 0x04;
pub const EXEC_STATUS: u32 = EXEC_BASE + 0x08;
pub const EXEC_LIMIT: u32 = EXEC_BASE + 0x0B;

// Custom synthesiser: nine channels of sixteen 32-bit registers, then the
// global mixer block.
pub const SYNTH_BASE: u32 = 0x01F1_0000;
pub const SYNTH_CHANNEL_STRIDE: u32 = 0x40;
pub const SYNTH_GLOBAL: u32 = SYNTH_BASE + 0x400;
pub const SYNTH_LIMIT: u32 = SYNTH_BASE + 0x4FF;

// Per-channel register offsets within a channel's bank.
pub const CH_FREQ: u32 = 0x00;
pub const CH_WAVEFORM: u32 = 0x04;
pub const CH_DUTY: u32 = 0x08;
pub const CH_VOLUME: u32 = 0x0C;
pub const CH_ATTACK: u32 = 0x10;
pub const CH_DECAY: u32 = 0x14;
pub const CH_SUSTAIN: u32 = 0x18;
pub const CH_RELEASE: u32 = 0x1C;
pub const CH_GATE: u32 = 0x20;
pub const CH_CUTOFF: u32 = 0x24;
pub const CH_RESONANCE: u32 = 0x28;
pub const CH_RING_SRC: u32 = 0x2C;
pub const CH_SYNC_SRC: u32 = 0x30;
pub const CH_PAN: u32 = 0x34;
pub const CH_ENHANCED: u32 = 0x38;

// Global mixer register offsets from SYNTH_GLOBAL.
pub const GLB_FILTER_MODE: u32 = 0x00;
pub const GLB_CUTOFF: u32 = 0x04;
pub const GLB_RESONANCE: u32 = 0x08;
pub const GLB_FILTER_MOD_SRC: u32 = 0x0C;
pub const GLB_FILTER_MOD_AMT: u32 = 0x10;
pub const GLB_OVERDRIVE: u32 = 0x14;
pub const GLB_REVERB_MIX: u32 = 0x18;

// Chip engine register banks. Each bank is byte-register semantics carried
// in the low lanes of 32-bit accesses; each has a player control block at
// +0x800 (start/stop/status for the attached music player).
pub const PSG_BASE: u32 = 0x01F2_0000;
pub const PSG_LIMIT: u32 = PSG_BASE + 0x8FF;
pub const SID_BASE: u32 = 0x01F2_1000;
pub const SID_LIMIT: u32 = SID_BASE + 0x8FF;
pub const POKEY_BASE: u32 = 0x01F2_2000;
pub const POKEY_LIMIT: u32 = POKEY_BASE + 0x8FF;
pub const TED_SOUND_BASE: u32 = 0x01F2_3000;
pub const TED_SOUND_LIMIT: u32 = TED_SOUND_BASE + 0x8FF;
pub const AHX_BASE: u32 = 0x01F2_4000;
pub const AHX_LIMIT: u32 = AHX_BASE + 0x8FF;

pub const PLAYER_CTRL: u32 = 0x800;
pub const PLAYER_STATUS: u32 = 0x804;

// Compositor / video control block. VIDEO_STATUS bit 1 is VBlank and has a
// lock-free reader path on the bus.
pub const VIDEO_BASE: u32 = 0x01F3_0000;
pub const VIDEO_CTRL: u32 = VIDEO_BASE;
pub const VIDEO_STATUS: u32 = VIDEO_BASE + 0x04;
pub const VIDEO_WIDTH: u32 = VIDEO_BASE + 0x08;
pub const VIDEO_HEIGHT: u32 = VIDEO_BASE + 0x0C;
pub const VIDEO_LIMIT: u32 = VIDEO_BASE + 0x3F;

pub const VIDEO_STATUS_VBLANK: u32 = 1 << 1;

// Framebuffer chip registers and copper/blitter command windows.
pub const FB_BASE: u32 = 0x01F4_0000;
pub const FB_CTRL: u32 = FB_BASE;
pub const FB_MODE: u32 = FB_BASE + 0x04;
pub const FB_SWAP: u32 = FB_BASE + 0x08;
pub const FB_STATUS: u32 = FB_BASE + 0x0C;
pub const FB_LIMIT: u32 = FB_BASE + 0x3F;

pub const COPPER_BASE: u32 = 0x01F5_0000;
pub const COPPER_CTRL: u32 = COPPER_BASE;
pub const COPPER_PROG: u32 = COPPER_BASE + 0x100;
pub const COPPER_PROG_WORDS: u32 = 1024;
pub const COPPER_LIMIT: u32 = COPPER_PROG + COPPER_PROG_WORDS * 4 - 1;

pub const BLT_BASE: u32 = 0x01F6_0000;
pub const BLT_OP: u32 = BLT_BASE;
pub const BLT_SRC: u32 = BLT_BASE + 0x04;
pub const BLT_DST: u32 = BLT_BASE + 0x08;
pub const BLT_WIDTH: u32 = BLT_BASE + 0x0C;
pub const BLT_HEIGHT: u32 = BLT_BASE + 0x10;
pub const BLT_SRC_STRIDE: u32 = BLT_BASE + 0x14;
pub const BLT_DST_STRIDE: u32 = BLT_BASE + 0x18;
pub const BLT_VALUE: u32 = BLT_BASE + 0x1C;
pub const BLT_MODE7: u32 = BLT_BASE + 0x20;
pub const BLT_GO: u32 = BLT_BASE + 0x24;
pub const BLT_STATUS: u32 = BLT_BASE + 0x28;
pub const BLT_LIMIT: u32 = BLT_BASE + 0x3F;

// Framebuffer VRAM window: 3 MiB, enough for 1024x768 true colour.
pub const FB_VRAM_BASE: u32 = 0x0180_0000;
pub const FB_VRAM_SIZE: u32 = 3 << 20;
pub const FB_VRAM_LIMIT: u32 = FB_VRAM_BASE + FB_VRAM_SIZE - 1;

// VGA register bank plus palette window. VGA scans guest RAM for its text
// and pixel memory at the historical addresses.
pub const VGA_BASE: u32 = 0x01F7_0000;
pub const VGA_MODE_REG: u32 = VGA_BASE;
pub const VGA_PAL_INDEX: u32 = VGA_BASE + 0x04;
pub const VGA_PAL_DATA: u32 = VGA_BASE + 0x08;
pub const VGA_PAL_BASE: u32 = VGA_BASE + 0x1000;
pub const VGA_PAL_LIMIT: u32 = VGA_PAL_BASE + 256 * 4 - 1;
pub const VGA_LIMIT: u32 = VGA_PAL_LIMIT;

pub const VGA_TEXT_RAM: u32 = 0x000B_8000;
pub const VGA_GFX_RAM: u32 = 0x000A_0000;

// ZX ULA, TED video and ANTIC/GTIA register banks. Their bitmaps live in
// guest RAM at the addresses their home machines used.
pub const ULA_BASE: u32 = 0x01FB_0000;
pub const ULA_BORDER: u32 = ULA_BASE;
pub const ULA_CTRL: u32 = ULA_BASE + 0x04;
pub const ULA_LIMIT: u32 = ULA_BASE + 0x0F;
pub const ULA_SCREEN_RAM: u32 = 0x4000;

pub const TED_VIDEO_BASE: u32 = 0x01FB_0100;
pub const TEDV_CTRL: u32 = TED_VIDEO_BASE;
pub const TEDV_BG: u32 = TED_VIDEO_BASE + 0x04;
pub const TEDV_BORDER: u32 = TED_VIDEO_BASE + 0x08;
pub const TEDV_MATRIX: u32 = TED_VIDEO_BASE + 0x0C;
pub const TEDV_CHARGEN: u32 = TED_VIDEO_BASE + 0x10;
pub const TEDV_COLOR: u32 = TED_VIDEO_BASE + 0x14;
pub const TED_VIDEO_LIMIT: u32 = TED_VIDEO_BASE + 0x1F;

pub const ANTIC_BASE: u32 = 0x01FB_0200;
pub const ANTIC_DLIST: u32 = ANTIC_BASE;
pub const ANTIC_CHBASE: u32 = ANTIC_BASE + 0x04;
pub const ANTIC_CTRL: u32 = ANTIC_BASE + 0x08;
pub const GTIA_COLBK: u32 = ANTIC_BASE + 0x0C;
pub const GTIA_COLPF0: u32 = ANTIC_BASE + 0x10;
pub const GTIA_COLPF1: u32 = ANTIC_BASE + 0x14;
pub const GTIA_COLPF2: u32 = ANTIC_BASE + 0x18;
pub const GTIA_COLPF3: u32 = ANTIC_BASE + 0x1C;
pub const ANTIC_LIMIT: u32 = ANTIC_BASE + 0x2F;

// Voodoo rasteriser command block and texture window.
pub const VOODOO_BASE: u32 = 0x01F8_0000;
pub const VOODOO_LIMIT: u32 = VOODOO_BASE + 0xFF;
pub const VOODOO_TEX_BASE: u32 = 0x01C0_0000;
pub const VOODOO_TEX_SIZE: u32 = 256 * 256 * 4;
pub const VOODOO_TEX_LIMIT: u32 = VOODOO_TEX_BASE + VOODOO_TEX_SIZE - 1;

// Coprocessor channels: four channels of eight registers.
pub const COPROC_BASE: u32 = 0x01F9_0000;
pub const COPROC_CHANNELS: u32 = 4;
pub const COPROC_STRIDE: u32 = 0x20;
pub const COPROC_LIMIT: u32 = COPROC_BASE + COPROC_CHANNELS * COPROC_STRIDE - 1;

pub const COP_FN: u32 = 0x00;
pub const COP_ARG: u32 = 0x04;
pub const COP_PUSH: u32 = 0x08;
pub const COP_POLL: u32 = 0x0C;
pub const COP_RESULT: u32 = 0x10;
pub const COP_CTRL: u32 = 0x14;
pub const COP_STATUS: u32 = 0x18;

// Z80 I/O port space is folded into the bus here: port n lives at
// Z80_PORT_BASE + n.
pub const Z80_PORT_BASE: u32 = 0x01FC_0000;
