use crate::broadcaster::Channel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Client-supplied filter narrowing a subscription.
///
/// Every present criterion must match. An operation without symbols covers
/// all symbols and therefore matches any symbol filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Only this operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    /// Only operations of this type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    /// Only operations touching any of these symbols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
}

impl SubscriptionFilter {
    /// Whether a message about the given operation passes.
    #[must_use]
    pub fn matches(&self, scope: &MessageScope<'_>) -> bool {
        if self.operation_id.is_some_and(|id| id != scope.operation_id) {
            return false;
        }
        if self
            .operation_type
            .as_deref()
            .is_some_and(|t| t != scope.operation_type)
        {
            return false;
        }
        self.symbols.is_empty()
            || scope.symbols.is_empty()
            || scope.symbols.iter().any(|s| self.symbols.contains(s))
    }
}

/// Attributes a filter is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MessageScope<'a> {
    /// Operation the message is about
    pub operation_id: Uuid,
    /// Its workflow type
    pub operation_type: &'a str,
    /// Its symbols
    pub symbols: &'a [String],
}

/// One channel subscription of one connection.
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub(crate) channel: Channel,
    pub(crate) filter: SubscriptionFilter,
    /// Operation version covered by the snapshot
    baselines: HashMap<Uuid, u64>,
    next_sequence: u64,
}

impl Subscription {
    pub(crate) fn new(
        channel: Channel,
        filter: SubscriptionFilter,
        baselines: HashMap<Uuid, u64>,
    ) -> Self {
        Self {
            channel,
            filter,
            baselines,
            next_sequence: 1,
        }
    }

    /// Take the next sequence number.
    pub(crate) fn advance(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Whether an event at `version` is new to this subscriber and passes
    /// the filter.
    pub(crate) fn accepts(&self, scope: &MessageScope<'_>, version: u64) -> bool {
        if !self.channel.carries(scope.operation_id) {
            return false;
        }
        if self
            .baselines
            .get(&scope.operation_id)
            .is_some_and(|baseline| version <= *baseline)
        {
            return false;
        }
        self.filter.matches(scope)
    }
}
