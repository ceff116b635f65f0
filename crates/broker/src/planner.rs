// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Delivery Planner (C5, §4.4). Pure: no I/O, no side effects. Consumes an
//! immutable [`RoutingSnapshot`] and produces an ordered, deterministic
//! [`DeliveryPlan`].

use crate::command::Target;
use crate::registry::RoutingSnapshot;

/// One planned recipient of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRecipient {
    pub agent_name: String,
    pub channel_hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub recipients: Vec<PlannedRecipient>,
    pub needs_dm_resolution: bool,
}

/// Resolve `to` against `snapshot`, from the perspective of `sender`
/// (excluded from fan-out to avoid self-echo, §4.4 rule 2/3).
pub fn plan_delivery(snapshot: &RoutingSnapshot, sender: &str, to: &Target) -> DeliveryPlan {
    match to {
        Target::AgentName(name) => {
            if snapshot.get(name).is_some_and(|a| a.lifecycle.is_live()) {
                DeliveryPlan {
                    recipients: vec![PlannedRecipient { agent_name: name.clone(), channel_hint: None }],
                    needs_dm_resolution: false,
                }
            } else {
                // Absent or retired name: the external bus's identity hint
                // may still disambiguate an inbound DM participant (§4.4
                // rule 1).
                DeliveryPlan { recipients: Vec::new(), needs_dm_resolution: true }
            }
        }
        Target::Broadcast => {
            let recipients = snapshot
                .live_workers_excluding(sender)
                .map(|a| PlannedRecipient { agent_name: a.name.clone(), channel_hint: None })
                .collect();
            DeliveryPlan { recipients, needs_dm_resolution: false }
        }
        Target::Channel(channel) => {
            let recipients = snapshot
                .channel_members_excluding(channel, sender)
                .into_iter()
                .map(|a| PlannedRecipient {
                    agent_name: a.name.clone(),
                    channel_hint: Some(channel.clone()),
                })
                .collect();
            DeliveryPlan { recipients, needs_dm_resolution: false }
        }
        Target::Bridge { project, name } => {
            // Out of core scope beyond tagging (§4.4 rule 4): the sibling
            // broker resolves the name on its side.
            DeliveryPlan {
                recipients: vec![PlannedRecipient {
                    agent_name: format!("{project}:{name}"),
                    channel_hint: None,
                }],
                needs_dm_resolution: false,
            }
        }
    }
}
