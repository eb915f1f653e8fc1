//! Environment knobs.
//!
//! All knobs are optional. `CommEnv::from_env` reads the process
//! environment once; builders may substitute a hand-built block, which
//! is what the test suite does to avoid process-global state.

use fabric::{MsgOrder, OpFlags};
use once_cell::sync::Lazy;

/// Parsed environment configuration.
#[derive(Debug, Clone, Default)]
pub struct CommEnv {
    /// Force a provider name (the `FI_PROVIDER` analog).
    pub provider: Option<String>,
    /// Abort instead of unwinding on fatal errors.
    pub abort_on_error: bool,
    /// Try delivery-complete before message ordering (default true).
    pub do_delivery_complete: Option<bool>,
    /// Permit a scalable transmit endpoint (default true).
    pub use_scalable_ep: Option<bool>,
    /// Cap on transmit contexts (None or 0 = auto).
    pub concurrency: Option<usize>,
    /// Ask providers for the atomic capability in the base hints.
    pub hints_caps_atomic: bool,
    /// Forced transmit op flags; a hard constraint when set.
    pub hints_tx_op_flags: Option<OpFlags>,
    /// Forced message orderings; a hard constraint when set.
    pub hints_msg_order: Option<MsgOrder>,
}

impl CommEnv {
    pub fn do_delivery_complete(&self) -> bool {
        self.do_delivery_complete.unwrap_or(true)
    }

    pub fn use_scalable_ep(&self) -> bool {
        self.use_scalable_ep.unwrap_or(true)
    }

    /// Whether the env forces completion or ordering hints; this turns
    /// off provider-quality filtering and the selection rounds.
    pub fn ord_cmplt_forced(&self) -> bool {
        self.hints_tx_op_flags.is_some() || self.hints_msg_order.is_some()
    }

    /// Read the process environment.
    pub fn from_env() -> Self {
        Self {
            provider: var("COMM_OFI_PROVIDER"),
            abort_on_error: var("COMM_OFI_ABORT_ON_ERROR").is_some(),
            do_delivery_complete: var("COMM_OFI_DO_DELIVERY_COMPLETE")
                .as_deref()
                .map(parse_bool),
            use_scalable_ep: var("COMM_OFI_USE_SCALABLE_EP").as_deref().map(parse_bool),
            concurrency: var("COMM_CONCURRENCY").and_then(|s| s.parse().ok()),
            hints_caps_atomic: var("COMM_OFI_HINTS_CAPS_ATOMIC")
                .as_deref()
                .map(parse_bool)
                .unwrap_or(false),
            hints_tx_op_flags: var("COMM_OFI_HINTS_TX_OP_FLAGS")
                .as_deref()
                .map(parse_op_flags),
            hints_msg_order: var("COMM_OFI_HINTS_MSG_ORDER")
                .as_deref()
                .map(parse_msg_order),
        }
    }

    /// The process environment, read once.
    pub fn global() -> &'static CommEnv {
        static ENV: Lazy<CommEnv> = Lazy::new(CommEnv::from_env);
        &ENV
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "true" | "t"
    )
}

/// Parse `|`-separated op-flag names, e.g. `"delivery-complete"`.
fn parse_op_flags(s: &str) -> OpFlags {
    let mut flags = OpFlags::empty();
    for tok in s.split('|') {
        match tok.trim().to_ascii_lowercase().as_str() {
            "completion" => flags |= OpFlags::COMPLETION,
            "delivery-complete" | "delivery_complete" => flags |= OpFlags::DELIVERY_COMPLETE,
            other => panic!("unknown op flag in COMM_OFI_HINTS_TX_OP_FLAGS: \"{other}\""),
        }
    }
    flags
}

/// Parse `|`-separated ordering names, e.g. `"raw|waw|saw"`.
fn parse_msg_order(s: &str) -> MsgOrder {
    let mut order = MsgOrder::empty();
    for tok in s.split('|') {
        match tok.trim().to_ascii_lowercase().as_str() {
            "raw" => order |= MsgOrder::RAW,
            "waw" => order |= MsgOrder::WAW,
            "saw" => order |= MsgOrder::SAW,
            "sas" => order |= MsgOrder::SAS,
            other => panic!("unknown ordering in COMM_OFI_HINTS_MSG_ORDER: \"{other}\""),
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("Yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn msg_order_parsing() {
        let o = parse_msg_order("raw|waw|saw");
        assert_eq!(o, MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW);
    }

    #[test]
    fn forced_hints_detection() {
        let mut env = CommEnv::default();
        assert!(!env.ord_cmplt_forced());
        env.hints_msg_order = Some(MsgOrder::RAW);
        assert!(env.ord_cmplt_forced());
    }
}
