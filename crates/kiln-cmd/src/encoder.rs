//! # Command Encoder
//!
//! Encode state and control commands into command stream bytes.
//!
//! The receiver decides *when* a command is needed. *How* it is laid out is
//! the encoder's business, so every hardware generation plugs in its own
//! [`CommandEncoder`]. [`PacketEncoder`] is a generation-neutral reference
//! layout used by tests and by the mock backend to read streams back.

use alloc::vec::Vec;

use kiln_core::{Error, GpuAddr, PreemptionMode, Result, ThreadArbitrationPolicy};

// =============================================================================
// COMMAND DESCRIPTIONS
// =============================================================================

bitflags::bitflags! {
    /// Barrier side effects
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BarrierFlags: u32 {
        /// Stall the command streamer until prior work drains
        const CS_STALL = 1 << 0;
        /// Flush the data cache
        const DC_FLUSH = 1 << 1;
        /// Invalidate the texture and sampler caches
        const TEXTURE_CACHE_INVALIDATE = 1 << 2;
        /// Invalidate the instruction cache
        const INSTRUCTION_CACHE_INVALIDATE = 1 << 3;
        /// Invalidate the state cache
        const STATE_CACHE_INVALIDATE = 1 << 4;
        /// Invalidate the constant cache
        const CONSTANT_CACHE_INVALIDATE = 1 << 5;
    }
}

impl BarrierFlags {
    /// Flags guarding a state base address change
    pub const STATE_BASE_ADDRESS_GUARD: Self = Self::CS_STALL
        .union(Self::DC_FLUSH)
        .union(Self::TEXTURE_CACHE_INVALIDATE);
}

/// Value written to memory when a barrier retires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostSync {
    /// Destination
    pub address: GpuAddr,
    /// Value
    pub value: u32,
}

/// A barrier command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierDesc {
    /// Side effects
    pub flags: BarrierFlags,
    /// Optional post-sync write
    pub post_sync: Option<PostSync>,
}

impl BarrierDesc {
    /// Plain stall
    pub const fn stall() -> Self {
        Self {
            flags: BarrierFlags::CS_STALL,
            post_sync: None,
        }
    }

    /// Barrier with explicit flags
    pub const fn with_flags(flags: BarrierFlags) -> Self {
        Self {
            flags,
            post_sync: None,
        }
    }

    /// Stall that writes `value` to `address` on retirement
    pub const fn tag_write(address: GpuAddr, value: u32, dc_flush: bool) -> Self {
        let flags = if dc_flush {
            BarrierFlags::CS_STALL.union(BarrierFlags::DC_FLUSH)
        } else {
            BarrierFlags::CS_STALL
        };
        Self {
            flags,
            post_sync: Some(PostSync { address, value }),
        }
    }
}

/// L3 cache partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L3Config {
    /// No shared local memory partition
    #[default]
    Default,
    /// Partition with shared local memory
    SharedLocalMemory,
}

/// Base address and size of one indirect heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapBase {
    /// Base address
    pub gpu_base: GpuAddr,
    /// Size in bytes
    pub size: u32,
}

/// Contents of a state base address command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateBaseAddress {
    /// General state base, where scratch lives
    pub general_state: GpuAddr,
    /// Dynamic state heap
    pub dynamic_state: HeapBase,
    /// Indirect object heap
    pub indirect_object: HeapBase,
    /// Surface state heap
    pub surface_state: HeapBase,
    /// Instruction heap base
    pub instruction: GpuAddr,
}

/// A command the receiver can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// One-time context setup
    Preamble {
        /// Initial preemption mode
        preemption: PreemptionMode,
        /// Initial arbitration policy
        arbitration: ThreadArbitrationPolicy,
        /// Initial L3 configuration
        l3: L3Config,
    },
    /// Pipeline selection
    PipelineSelect {
        /// Media sampler enabled
        media_sampler: bool,
    },
    /// Heap and scratch base addresses
    StateBaseAddress(StateBaseAddress),
    /// Cache and execution barrier
    Barrier(BarrierDesc),
    /// Scratch and front end configuration
    ScratchState {
        /// Scratch allocation
        scratch: GpuAddr,
        /// Per-thread scratch size
        per_thread_size: u32,
    },
    /// Thread arbitration policy change
    ThreadArbitration(ThreadArbitrationPolicy),
    /// L3 configuration change
    L3Config(L3Config),
    /// Preemption mode change
    Preemption(PreemptionMode),
    /// Continue execution at another address
    BatchBufferStart {
        /// Jump target
        target: GpuAddr,
    },
    /// End of a command buffer chain
    BatchBufferEnd,
}

/// Command category, for size queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Preamble
    Preamble,
    /// Pipeline select
    PipelineSelect,
    /// State base address
    StateBaseAddress,
    /// Barrier
    Barrier,
    /// Scratch state
    ScratchState,
    /// Thread arbitration
    ThreadArbitration,
    /// L3 configuration
    L3Config,
    /// Preemption
    Preemption,
    /// Batch buffer start
    BatchBufferStart,
    /// Batch buffer end
    BatchBufferEnd,
}

impl Command {
    /// Category of this command
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Preamble { .. } => CommandKind::Preamble,
            Self::PipelineSelect { .. } => CommandKind::PipelineSelect,
            Self::StateBaseAddress(_) => CommandKind::StateBaseAddress,
            Self::Barrier(_) => CommandKind::Barrier,
            Self::ScratchState { .. } => CommandKind::ScratchState,
            Self::ThreadArbitration(_) => CommandKind::ThreadArbitration,
            Self::L3Config(_) => CommandKind::L3Config,
            Self::Preemption(_) => CommandKind::Preemption,
            Self::BatchBufferStart { .. } => CommandKind::BatchBufferStart,
            Self::BatchBufferEnd => CommandKind::BatchBufferEnd,
        }
    }
}

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Generation-specific command layout
pub trait CommandEncoder {
    /// Size in bytes of a command category
    fn size_of(&self, kind: CommandKind) -> usize;

    /// Encode a command into `out`, which is exactly `size_of(command.kind())` bytes
    fn encode(&self, command: &Command, out: &mut [u8]) -> Result<()>;

    /// Fill `out` with no-ops
    fn encode_noop(&self, out: &mut [u8]);

    /// Get encoder name
    fn name(&self) -> &'static str;
}

// =============================================================================
// PACKET ENCODER
// =============================================================================

/// Reference packet layout
///
/// ```text
/// dword 0:  opcode << 24 | length in dwords (header included)
/// dword 1+: payload
/// ```
///
/// An all-zero dword is a one-dword no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketEncoder;

/// Packet opcodes
pub mod opcode {
    /// No-op dword
    pub const NOOP: u8 = 0x00;
    /// Preamble
    pub const PREAMBLE: u8 = 0x01;
    /// Pipeline select
    pub const PIPELINE_SELECT: u8 = 0x02;
    /// State base address
    pub const STATE_BASE_ADDRESS: u8 = 0x03;
    /// Barrier
    pub const BARRIER: u8 = 0x04;
    /// Scratch state
    pub const SCRATCH_STATE: u8 = 0x05;
    /// Thread arbitration
    pub const THREAD_ARBITRATION: u8 = 0x06;
    /// L3 configuration
    pub const L3_CONFIG: u8 = 0x07;
    /// Preemption
    pub const PREEMPTION: u8 = 0x08;
    /// Batch buffer start
    pub const BATCH_BUFFER_START: u8 = 0x09;
    /// Batch buffer end
    pub const BATCH_BUFFER_END: u8 = 0x0A;
}

const BATCH_BUFFER_START_DWORDS: usize = 3;
const BATCH_BUFFER_END_DWORDS: usize = 1;

// A batch buffer end padded with no-ops is patched into a start in place.
static_assertions::const_assert!(BATCH_BUFFER_END_DWORDS <= BATCH_BUFFER_START_DWORDS);

impl PacketEncoder {
    /// Create the encoder
    pub const fn new() -> Self {
        Self
    }

    const fn dwords(kind: CommandKind) -> usize {
        match kind {
            CommandKind::Preamble => 4,
            CommandKind::PipelineSelect => 2,
            CommandKind::StateBaseAddress => 14,
            CommandKind::Barrier => 5,
            CommandKind::ScratchState => 4,
            CommandKind::ThreadArbitration => 2,
            CommandKind::L3Config => 2,
            CommandKind::Preemption => 2,
            CommandKind::BatchBufferStart => BATCH_BUFFER_START_DWORDS,
            CommandKind::BatchBufferEnd => BATCH_BUFFER_END_DWORDS,
        }
    }

    const fn opcode(kind: CommandKind) -> u8 {
        match kind {
            CommandKind::Preamble => opcode::PREAMBLE,
            CommandKind::PipelineSelect => opcode::PIPELINE_SELECT,
            CommandKind::StateBaseAddress => opcode::STATE_BASE_ADDRESS,
            CommandKind::Barrier => opcode::BARRIER,
            CommandKind::ScratchState => opcode::SCRATCH_STATE,
            CommandKind::ThreadArbitration => opcode::THREAD_ARBITRATION,
            CommandKind::L3Config => opcode::L3_CONFIG,
            CommandKind::Preemption => opcode::PREEMPTION,
            CommandKind::BatchBufferStart => opcode::BATCH_BUFFER_START,
            CommandKind::BatchBufferEnd => opcode::BATCH_BUFFER_END,
        }
    }

    const fn kind_of(op: u8) -> Option<CommandKind> {
        Some(match op {
            opcode::PREAMBLE => CommandKind::Preamble,
            opcode::PIPELINE_SELECT => CommandKind::PipelineSelect,
            opcode::STATE_BASE_ADDRESS => CommandKind::StateBaseAddress,
            opcode::BARRIER => CommandKind::Barrier,
            opcode::SCRATCH_STATE => CommandKind::ScratchState,
            opcode::THREAD_ARBITRATION => CommandKind::ThreadArbitration,
            opcode::L3_CONFIG => CommandKind::L3Config,
            opcode::PREEMPTION => CommandKind::Preemption,
            opcode::BATCH_BUFFER_START => CommandKind::BatchBufferStart,
            opcode::BATCH_BUFFER_END => CommandKind::BatchBufferEnd,
            _ => return None,
        })
    }
}

fn lo(addr: GpuAddr) -> u32 {
    addr.raw() as u32
}

fn hi(addr: GpuAddr) -> u32 {
    (addr.raw() >> 32) as u32
}

fn preemption_bits(mode: PreemptionMode) -> u32 {
    match mode {
        PreemptionMode::Disabled => 0,
        PreemptionMode::MidBatch => 1,
        PreemptionMode::ThreadGroup => 2,
        PreemptionMode::MidThread => 3,
    }
}

fn arbitration_bits(policy: ThreadArbitrationPolicy) -> u32 {
    match policy {
        ThreadArbitrationPolicy::AgeBased => 0,
        ThreadArbitrationPolicy::RoundRobin => 1,
        ThreadArbitrationPolicy::RoundRobinAfterDependency => 2,
    }
}

fn l3_bits(config: L3Config) -> u32 {
    match config {
        L3Config::Default => 0,
        L3Config::SharedLocalMemory => 1,
    }
}

impl CommandEncoder for PacketEncoder {
    fn size_of(&self, kind: CommandKind) -> usize {
        Self::dwords(kind) * 4
    }

    fn encode(&self, command: &Command, out: &mut [u8]) -> Result<()> {
        let kind = command.kind();
        let dwords = Self::dwords(kind);
        if out.len() != dwords * 4 {
            return Err(Error::InvalidParameter);
        }

        let mut packet = [0u32; 14];
        packet[0] = (Self::opcode(kind) as u32) << 24 | dwords as u32;
        match command {
            Command::Preamble {
                preemption,
                arbitration,
                l3,
            } => {
                packet[1] = preemption_bits(*preemption);
                packet[2] = arbitration_bits(*arbitration);
                packet[3] = l3_bits(*l3);
            }
            Command::PipelineSelect { media_sampler } => {
                packet[1] = *media_sampler as u32;
            }
            Command::StateBaseAddress(sba) => {
                packet[1] = lo(sba.general_state);
                packet[2] = hi(sba.general_state);
                for (i, heap) in [sba.dynamic_state, sba.indirect_object, sba.surface_state]
                    .iter()
                    .enumerate()
                {
                    packet[3 + i * 3] = lo(heap.gpu_base);
                    packet[4 + i * 3] = hi(heap.gpu_base);
                    packet[5 + i * 3] = heap.size;
                }
                packet[12] = lo(sba.instruction);
                packet[13] = hi(sba.instruction);
            }
            Command::Barrier(barrier) => {
                packet[1] = barrier.flags.bits();
                if let Some(post_sync) = barrier.post_sync {
                    packet[1] |= 1 << 31;
                    packet[2] = lo(post_sync.address);
                    packet[3] = hi(post_sync.address);
                    packet[4] = post_sync.value;
                }
            }
            Command::ScratchState {
                scratch,
                per_thread_size,
            } => {
                packet[1] = lo(*scratch);
                packet[2] = hi(*scratch);
                packet[3] = *per_thread_size;
            }
            Command::ThreadArbitration(policy) => packet[1] = arbitration_bits(*policy),
            Command::L3Config(config) => packet[1] = l3_bits(*config),
            Command::Preemption(mode) => packet[1] = preemption_bits(*mode),
            Command::BatchBufferStart { target } => {
                packet[1] = lo(*target);
                packet[2] = hi(*target);
            }
            Command::BatchBufferEnd => {}
        }

        for (chunk, dword) in out.chunks_exact_mut(4).zip(packet.iter()) {
            chunk.copy_from_slice(&dword.to_le_bytes());
        }
        Ok(())
    }

    fn encode_noop(&self, out: &mut [u8]) {
        out.fill(0);
    }

    fn name(&self) -> &'static str {
        "packet"
    }
}

// =============================================================================
// DECODING
// =============================================================================

/// A command read back from a [`PacketEncoder`] stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedCommand {
    /// A known command
    Command(Command),
    /// One no-op dword
    Noop,
    /// Unknown opcode, skipped by its length
    Unknown(u8),
}

impl DecodedCommand {
    /// Category of a known command
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            Self::Command(command) => Some(command.kind()),
            _ => None,
        }
    }
}

fn decode_preemption(bits: u32) -> PreemptionMode {
    match bits {
        0 => PreemptionMode::Disabled,
        1 => PreemptionMode::MidBatch,
        3 => PreemptionMode::MidThread,
        _ => PreemptionMode::ThreadGroup,
    }
}

fn decode_arbitration(bits: u32) -> ThreadArbitrationPolicy {
    match bits {
        1 => ThreadArbitrationPolicy::RoundRobin,
        2 => ThreadArbitrationPolicy::RoundRobinAfterDependency,
        _ => ThreadArbitrationPolicy::AgeBased,
    }
}

fn decode_l3(bits: u32) -> L3Config {
    if bits == 1 {
        L3Config::SharedLocalMemory
    } else {
        L3Config::Default
    }
}

fn addr(lo: u32, hi: u32) -> GpuAddr {
    GpuAddr::new((hi as u64) << 32 | lo as u64)
}

/// Decode a [`PacketEncoder`] stream
///
/// Decoding stops at a truncated packet. Known opcodes whose length does not
/// match their packet size are reported as unknown.
pub fn decode_stream(bytes: &[u8]) -> Vec<DecodedCommand> {
    let dwords: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < dwords.len() {
        let header = dwords[pos];
        if header == 0 {
            commands.push(DecodedCommand::Noop);
            pos += 1;
            continue;
        }

        let op = (header >> 24) as u8;
        let len = ((header & 0xFFFF) as usize).max(1);
        let Some(p) = dwords.get(pos..pos + len) else {
            break;
        };
        let known = PacketEncoder::kind_of(op).filter(|kind| PacketEncoder::dwords(*kind) == len);
        let Some(kind) = known else {
            commands.push(DecodedCommand::Unknown(op));
            pos += len;
            continue;
        };

        let command = match kind {
            CommandKind::Preamble => Command::Preamble {
                preemption: decode_preemption(p[1]),
                arbitration: decode_arbitration(p[2]),
                l3: decode_l3(p[3]),
            },
            CommandKind::PipelineSelect => Command::PipelineSelect {
                media_sampler: p[1] != 0,
            },
            CommandKind::StateBaseAddress => {
                let heap = |i: usize| HeapBase {
                    gpu_base: addr(p[3 + i * 3], p[4 + i * 3]),
                    size: p[5 + i * 3],
                };
                Command::StateBaseAddress(StateBaseAddress {
                    general_state: addr(p[1], p[2]),
                    dynamic_state: heap(0),
                    indirect_object: heap(1),
                    surface_state: heap(2),
                    instruction: addr(p[12], p[13]),
                })
            }
            CommandKind::Barrier => Command::Barrier(BarrierDesc {
                flags: BarrierFlags::from_bits_truncate(p[1]),
                post_sync: (p[1] & 1 << 31 != 0).then(|| PostSync {
                    address: addr(p[2], p[3]),
                    value: p[4],
                }),
            }),
            CommandKind::ScratchState => Command::ScratchState {
                scratch: addr(p[1], p[2]),
                per_thread_size: p[3],
            },
            CommandKind::ThreadArbitration => Command::ThreadArbitration(decode_arbitration(p[1])),
            CommandKind::L3Config => Command::L3Config(decode_l3(p[1])),
            CommandKind::Preemption => Command::Preemption(decode_preemption(p[1])),
            CommandKind::BatchBufferStart => Command::BatchBufferStart {
                target: addr(p[1], p[2]),
            },
            CommandKind::BatchBufferEnd => Command::BatchBufferEnd,
        };
        commands.push(DecodedCommand::Command(command));
        pos += len;
    }
    commands
}

/// Count decoded commands of one category
pub fn count_kind(commands: &[DecodedCommand], kind: CommandKind) -> usize {
    commands.iter().filter(|c| c.kind() == Some(kind)).count()
}
