//! Provider selection.
//!
//! We need either a provider that completes operations only after the
//! target has received the data (delivery-complete), or one whose
//! read-after-write, write-after-write, and send-after-write orderings
//! let the ordering layer emulate that with dummy GETs. Providers
//! rarely volunteer either property unasked, so selection runs rounds
//! of hint-modified queries: first hunting a "good" core provider
//! (neither tcp nor sockets) with each property, then settling for a
//! less-good one.

use fabric::{getinfo, Caps, Hints, Info, MsgOrder, Node, OpFlags};

use crate::env::CommEnv;
use crate::error::{Error, Result};

/// Provider-specific behavior controls derived from the selected name.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ProvCtl {
    /// Size address vectors by endpoint count (RxD-like providers
    /// record per-endpoint address state).
    pub size_avs_by_num_eps: bool,
    /// Poll/wait sets are unreliable on this provider.
    pub no_wait_sets: bool,
}

#[derive(Debug)]
pub(crate) struct Selection {
    pub info: Info,
    pub have_delivery_complete: bool,
    pub prov_ctl: ProvCtl,
}

/// Is `name` one of the `;`-separated components of `stack`?
fn is_in_prov_name(name: &str, stack: &str) -> bool {
    stack.split(';').any(|tok| tok == name)
}

fn is_good_core_provider(info: &Info) -> bool {
    let pn = &info.fabric_attr.prov_name;
    !is_in_prov_name("sockets", pn) && !is_in_prov_name("tcp", pn)
}

/// Base hints for our fundamental requirements.
fn base_hints(env: &CommEnv, fixed_heap: bool, num_nodes: usize) -> Hints {
    let mut hints = Hints::default();
    hints.caps =
        Caps::MSG | Caps::MULTI_RECV | Caps::RMA | Caps::LOCAL_COMM | Caps::REMOTE_COMM;
    if env.hints_caps_atomic {
        hints.caps |= Caps::ATOMIC;
    }
    hints.tx_attr.op_flags = OpFlags::COMPLETION;
    hints.tx_attr.msg_order = MsgOrder::SAS;
    hints.rx_attr.msg_order = hints.tx_attr.msg_order;
    hints.domain_attr.resource_mgmt = true;
    hints.domain_attr.mr_mode = fabric::MrMode::LOCAL
        | fabric::MrMode::VIRT_ADDR
        | fabric::MrMode::PROV_KEY
        | fabric::MrMode::ENDPOINT;
    if num_nodes > 1 && fixed_heap {
        hints.domain_attr.mr_mode |= fabric::MrMode::ALLOCATED;
    }

    // Env-forced hints become hard constraints.
    if let Some(flags) = env.hints_tx_op_flags {
        hints.tx_attr.op_flags = flags;
    }
    if let Some(order) = env.hints_msg_order {
        hints.tx_attr.msg_order = order;
        hints.rx_attr.msg_order = order;
    }
    hints
}

fn find_prov_in_list(
    list: Vec<Info>,
    skip_ungood_provs: bool,
    skip_rxm_provs: bool,
) -> Option<Info> {
    list.into_iter().find(|info| {
        let pn = &info.fabric_attr.prov_name;
        (!skip_ungood_provs || is_good_core_provider(info))
            && !(skip_rxm_provs && is_in_prov_name("ofi_rxm", pn))
    })
}

fn find_provider(
    node: &Node,
    env: &CommEnv,
    hints: &Hints,
    good_only: bool,
    skip_rxm_provs: bool,
    feature: &str,
) -> Option<Info> {
    // Forcing a provider by name turns off the good-provider check.
    let skip_ungood = good_only && env.provider.is_none();
    let mut list = getinfo(node, hints);
    if let Some(forced) = &env.provider {
        list.retain(|i| is_in_prov_name(forced, &i.fabric_attr.prov_name)
            || i.fabric_attr.prov_name == *forced);
    }
    let found = find_prov_in_list(list, skip_ungood, skip_rxm_provs);
    tracing::debug!(
        feature,
        good_only,
        found = found.is_some(),
        "provider selection round"
    );
    found
}

/// Hunt for a provider with delivery-complete. Utility providers that
/// advertise it but are known not to implement it correctly are
/// excluded unless the user forced them by name.
fn find_dlvr_cmplt_prov(node: &Node, env: &CommEnv, hints: &Hints, good_only: bool) -> Option<Info> {
    let forced_rxm = env
        .provider
        .as_deref()
        .map(|p| is_in_prov_name("ofi_rxm", p))
        .unwrap_or(false);
    let mut h = hints.clone();
    h.tx_attr.op_flags = OpFlags::DELIVERY_COMPLETE;
    find_provider(node, env, &h, good_only, !forced_rxm, "delivery-complete")
}

/// Hunt for a provider with the orderings the MCM emulation needs.
fn find_msg_order_prov(node: &Node, env: &CommEnv, hints: &Hints, good_only: bool) -> Option<Info> {
    let mut h = hints.clone();
    h.tx_attr.msg_order |= MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW;
    h.rx_attr.msg_order = h.tx_attr.msg_order;
    find_provider(node, env, &h, good_only, false, "message orderings")
}

pub(crate) fn select(
    node: &Node,
    env: &CommEnv,
    fixed_heap: bool,
    num_nodes: usize,
) -> Result<Selection> {
    let hints = base_hints(env, fixed_heap, num_nodes);

    let mut found: Option<Info> = None;

    if env.ord_cmplt_forced() {
        // Manually overridden orderings or completion level: use the
        // hints as-is and skip the selection rounds entirely.
        found = getinfo(node, &hints).into_iter().next();
    } else {
        type Round = fn(&Node, &CommEnv, &Hints, bool) -> Option<Info>;
        let rounds: [Round; 2] = if env.do_delivery_complete() {
            [find_dlvr_cmplt_prov, find_msg_order_prov]
        } else {
            [find_msg_order_prov, find_dlvr_cmplt_prov]
        };

        // A good provider with either property, then any provider.
        for good_only in [true, false] {
            for round in rounds {
                if found.is_none() {
                    found = round(node, env, &hints, good_only);
                }
            }
        }
    }

    let info = found.ok_or_else(|| Error::NoProvider {
        prov_name: env.provider.clone(),
    })?;

    let have_delivery_complete = info.tx_attr.op_flags.contains(OpFlags::DELIVERY_COMPLETE);
    let pn = info.fabric_attr.prov_name.clone();
    let prov_ctl = ProvCtl {
        size_avs_by_num_eps: is_in_prov_name("ofi_rxd", &pn),
        no_wait_sets: is_in_prov_name("efa", &pn) || is_in_prov_name("gni", &pn),
    };

    tracing::debug!(
        provider = %pn,
        have_delivery_complete,
        "selected fabric provider"
    );

    Ok(Selection {
        info,
        have_delivery_complete,
        prov_ctl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric::{Cluster, ClusterConfig};

    fn node_with(cfg: ClusterConfig) -> Node {
        Cluster::launch(cfg).remove(0)
    }

    #[test]
    fn prefers_delivery_complete() {
        let node = node_with(ClusterConfig::default());
        let sel = select(&node, &CommEnv::default(), false, 1).unwrap();
        assert!(sel.have_delivery_complete);
    }

    #[test]
    fn falls_back_to_message_order() {
        let node = node_with(ClusterConfig {
            delivery_complete: false,
            ..Default::default()
        });
        let sel = select(&node, &CommEnv::default(), false, 1).unwrap();
        assert!(!sel.have_delivery_complete);
        assert!(sel
            .info
            .tx_attr
            .msg_order
            .contains(MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW));
    }

    #[test]
    fn msg_order_preferred_when_env_says_so() {
        let node = node_with(ClusterConfig::default());
        let env = CommEnv {
            do_delivery_complete: Some(false),
            ..Default::default()
        };
        let sel = select(&node, &env, false, 1).unwrap();
        assert!(!sel.have_delivery_complete);
    }

    #[test]
    fn ungood_provider_needs_fallback_round() {
        // A tcp-stacked provider fails the good-provider rounds but is
        // accepted in the fallback rounds.
        let node = node_with(ClusterConfig {
            prov_name: "tcp".to_string(),
            ..Default::default()
        });
        let sel = select(&node, &CommEnv::default(), false, 1).unwrap();
        assert_eq!(sel.info.fabric_attr.prov_name, "tcp");
    }

    #[test]
    fn rxm_excluded_from_delivery_complete() {
        // An RxM-stacked provider advertising delivery-complete is not
        // believed; selection takes the message-order round instead.
        let node = node_with(ClusterConfig {
            prov_name: "verbs;ofi_rxm".to_string(),
            ..Default::default()
        });
        let sel = select(&node, &CommEnv::default(), false, 1).unwrap();
        assert!(!sel.have_delivery_complete);
    }

    #[test]
    fn forced_rxm_gets_delivery_complete() {
        let node = node_with(ClusterConfig {
            prov_name: "verbs;ofi_rxm".to_string(),
            ..Default::default()
        });
        let env = CommEnv {
            provider: Some("ofi_rxm".to_string()),
            ..Default::default()
        };
        let sel = select(&node, &env, false, 1).unwrap();
        assert!(sel.have_delivery_complete);
    }

    #[test]
    fn no_provider_for_unknown_name() {
        let node = node_with(ClusterConfig::default());
        let env = CommEnv {
            provider: Some("verbs".to_string()),
            ..Default::default()
        };
        let err = select(&node, &env, false, 1).unwrap_err();
        assert!(matches!(err, Error::NoProvider { .. }));
    }

    #[test]
    fn forced_msg_order_is_hard_constraint() {
        let node = node_with(ClusterConfig::default());
        let env = CommEnv {
            hints_msg_order: Some(MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW | MsgOrder::SAS),
            ..Default::default()
        };
        let sel = select(&node, &env, false, 1).unwrap();
        // Forced hints bypass the rounds: no delivery-complete asked
        // for, none reported.
        assert!(!sel.have_delivery_complete);
    }
}
