//! Provider capability discovery.
//!
//! `Hints` describes what the caller needs; `getinfo` returns `Info`
//! descriptors for provider instances that can satisfy those needs.
//! Providers do not volunteer capabilities that were not asked for,
//! so callers that depend on an ordering or a completion level must
//! put it in the hints.

use bitflags::bitflags;

use crate::inproc::Node;

bitflags! {
    /// Primary capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        /// Two-sided messaging (send/receive).
        const MSG = 1 << 0;
        /// Multi-receive buffers on receive endpoints.
        const MULTI_RECV = 1 << 1;
        /// One-sided read/write.
        const RMA = 1 << 2;
        /// Remote atomic operations.
        const ATOMIC = 1 << 3;
        /// Transactions directed at the local node.
        const LOCAL_COMM = 1 << 4;
        /// Transactions directed at remote nodes.
        const REMOTE_COMM = 1 << 5;
    }
}

bitflags! {
    /// Transmit/receive op flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// Generate a completion for each operation.
        const COMPLETION = 1 << 0;
        /// Completion implies the target has received the data.
        const DELIVERY_COMPLETE = 1 << 1;
    }
}

bitflags! {
    /// Message orderings between operations on one tx->rx endpoint pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgOrder: u32 {
        /// Read after write.
        const RAW = 1 << 0;
        /// Write after write.
        const WAW = 1 << 1;
        /// Send after write.
        const SAW = 1 << 2;
        /// Send after send.
        const SAS = 1 << 3;
    }
}

bitflags! {
    /// Memory registration mode bits.
    ///
    /// An empty mode means scalable registration: all of memory is
    /// remotely accessible under key 0 without explicit registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MrMode: u32 {
        /// Local buffers must be registered and a descriptor supplied.
        const LOCAL = 1 << 0;
        /// Remote offsets are virtual addresses, not region offsets.
        const VIRT_ADDR = 1 << 1;
        /// The provider chooses registration keys.
        const PROV_KEY = 1 << 2;
        /// Registered regions must be backed by allocated memory.
        const ALLOCATED = 1 << 3;
        /// Regions must be bound to an endpoint before use.
        const ENDPOINT = 1 << 4;
    }
}

bitflags! {
    /// Memory region access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Access: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const REMOTE_READ = 1 << 4;
        const REMOTE_WRITE = 1 << 5;
    }
}

/// Endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpType {
    /// Reliable datagram: connectionless, reliable, unordered peers.
    #[default]
    ReliableDatagram,
}

/// Address vector layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvType {
    /// Dense table indexed by insertion order.
    #[default]
    Table,
}

/// Threading model the caller promises to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threading {
    /// The caller serialises access per domain object.
    #[default]
    Domain,
}

/// Progress model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Progress {
    /// The caller must poll to drive transfers.
    #[default]
    Manual,
    /// The provider makes progress on its own.
    Auto,
}

/// Transmit attributes.
#[derive(Debug, Clone, Default)]
pub struct TxAttr {
    pub op_flags: OpFlags,
    pub msg_order: MsgOrder,
    /// Largest buffer `inject`/`inject_write` accepts.
    pub inject_size: usize,
}

/// Receive attributes.
#[derive(Debug, Clone, Default)]
pub struct RxAttr {
    pub op_flags: OpFlags,
    pub msg_order: MsgOrder,
}

/// Endpoint attributes.
#[derive(Debug, Clone)]
pub struct EpAttr {
    pub ep_type: EpType,
    /// Largest single transfer the provider will accept.
    pub max_msg_size: usize,
    /// Number of transmit contexts requested on a scalable endpoint.
    pub tx_ctx_cnt: usize,
}

impl Default for EpAttr {
    fn default() -> Self {
        Self {
            ep_type: EpType::ReliableDatagram,
            max_msg_size: usize::MAX,
            tx_ctx_cnt: 1,
        }
    }
}

/// Domain attributes.
#[derive(Debug, Clone)]
pub struct DomainAttr {
    pub threading: Threading,
    pub resource_mgmt: bool,
    pub av_type: AvType,
    pub mr_mode: MrMode,
    /// Maximum transmit contexts on one scalable endpoint.
    pub max_ep_tx_ctx: usize,
    /// Maximum regular endpoints per domain.
    pub ep_cnt: usize,
    /// Completion counters available (0 = none).
    pub cntr_cnt: usize,
    pub data_progress: Progress,
}

impl Default for DomainAttr {
    fn default() -> Self {
        Self {
            threading: Threading::Domain,
            resource_mgmt: false,
            av_type: AvType::Table,
            mr_mode: MrMode::empty(),
            max_ep_tx_ctx: 1,
            ep_cnt: 1,
            cntr_cnt: 0,
            data_progress: Progress::Manual,
        }
    }
}

/// Fabric attributes.
#[derive(Debug, Clone, Default)]
pub struct FabricAttr {
    /// Semicolon-separated provider name stack, e.g. `"verbs;ofi_rxm"`.
    pub prov_name: String,
}

/// What the caller requires of a provider.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub caps: Caps,
    pub tx_attr: TxAttr,
    pub rx_attr: RxAttr,
    pub ep_attr: EpAttr,
    pub domain_attr: DomainAttr,
}

/// A provider instance able to satisfy a set of hints.
///
/// Open a `Domain` from this to start using the provider.
#[derive(Debug, Clone)]
pub struct Info {
    pub caps: Caps,
    pub tx_attr: TxAttr,
    pub rx_attr: RxAttr,
    pub ep_attr: EpAttr,
    pub domain_attr: DomainAttr,
    pub fabric_attr: FabricAttr,
    pub(crate) node: Node,
}

/// Query the fabric for provider instances matching `hints`.
///
/// The returned descriptors report only what was hinted at: orderings
/// and completion levels absent from the hints are absent from the
/// results even when the provider could do them.
pub fn getinfo(node: &Node, hints: &Hints) -> Vec<Info> {
    node.getinfo(hints)
}
