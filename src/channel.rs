// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Channel Table
//!
//! This module provides the mapping from caller-chosen channel names to the
//! live channel handles returned by the broker. Exactly two mutators exist:
//! insertion on a successful open and removal on close (caller- or
//! broker-initiated). Lookups for absent names fail fast with an argument
//! error instead of a silent miss, surfacing stale channel names at the
//! call that uses them.

use crate::broker::BrokerChannel;
use crate::errors::AmqpError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Name to broker channel handle map of one client instance.
#[derive(Default)]
pub(crate) struct ChannelTable {
    entries: Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
}

impl ChannelTable {
    pub(crate) fn new() -> ChannelTable {
        ChannelTable::default()
    }

    /// Inserts a freshly opened channel under the given name.
    ///
    /// Fails if the name is still mapped to an open channel.
    pub(crate) fn insert(
        &self,
        name: &str,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<(), AmqpError> {
        let mut entries = self.entries.lock().unwrap();

        if entries.contains_key(name) {
            return Err(AmqpError::ChannelAlreadyOpen(name.to_owned()));
        }

        entries.insert(name.to_owned(), channel);
        Ok(())
    }

    /// Looks up the channel mapped to the given name.
    pub(crate) fn get(&self, name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownChannel(name.to_owned()))
    }

    /// Removes and returns the channel mapped to the given name.
    pub(crate) fn remove(&self, name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.entries
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| AmqpError::UnknownChannel(name.to_owned()))
    }

    /// Whether the given name is mapped to an open channel.
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Drops every entry, returning the drained names.
    pub(crate) fn drain(&self) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        entries.drain().map(|(name, _)| name).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
