//! Managing a set of live pipelines as one unit.
//!
//! A [`PipelineGroup`] owns every live pipeline built from an external
//! device list. The list is authoritative: [`PipelineGroup::read`]
//! rebuilds the whole set from a snapshot, [`PipelineGroup::update`]
//! diffs by device id. Shutdown is parallel by construction: every
//! member gets its stop request before any member is waited on, so total
//! teardown latency is bounded by the slowest member instead of the sum.

use crate::config::StreamConfig;
use crate::error::Result;
use crate::pipeline::LivePipeline;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A typed attribute value used for pipeline lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// A string attribute, e.g. an address.
    Str(String),
    /// An integer attribute, e.g. a slot or id.
    Int(i64),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        AttrValue::Int(value as i64)
    }
}

/// Builds live pipelines from stream configs.
///
/// The factory owns whatever the pipelines need at construction time
/// (handles to the shared source service, decoder instances, render
/// targets) so the group itself stays free of collaborator knowledge.
pub trait PipelineFactory: Send {
    /// Build and start a pipeline for one stream.
    fn build(&mut self, cfg: &StreamConfig) -> Result<Arc<LivePipeline>>;
}

struct GroupInner {
    factory: Box<dyn PipelineFactory>,
    members: Vec<Arc<LivePipeline>>,
}

/// A managed group of live pipelines.
pub struct PipelineGroup {
    inner: Mutex<GroupInner>,
}

impl PipelineGroup {
    /// Create an empty group around a factory.
    pub fn new(factory: Box<dyn PipelineFactory>) -> Self {
        Self {
            inner: Mutex::new(GroupInner {
                factory,
                members: Vec::new(),
            }),
        }
    }

    /// Number of member pipelines.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().members.len()
    }

    /// Check if the group has no members.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().members.is_empty()
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Arc<LivePipeline>> {
        self.inner.lock().unwrap().members.clone()
    }

    /// Find the first member whose attribute `key` equals `value`.
    ///
    /// Logs (and returns `None`) when no member exposes the attribute at
    /// all, which usually means a typo at the call site rather than an
    /// absent pipeline.
    pub fn find(&self, key: &str, value: impl Into<AttrValue>) -> Option<Arc<LivePipeline>> {
        let value = value.into();
        let g = self.inner.lock().unwrap();

        let mut key_known = g.members.is_empty();
        for member in &g.members {
            if let Some(attr) = member.attribute(key) {
                key_known = true;
                if attr == value {
                    return Some(Arc::clone(member));
                }
            }
        }
        if !key_known {
            warn!(key, "no member exposes this attribute");
        }
        None
    }

    /// Rebuild the whole member set from a device-list snapshot.
    ///
    /// Every existing pipeline is closed and a new one is built for
    /// every config: a full resynchronization, not a diff. A build
    /// failure aborts the rebuild and is returned; members built before
    /// the failure are kept.
    pub fn read(&self, configs: &[StreamConfig]) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        let old = std::mem::take(&mut g.members);
        close_all(&old);

        for cfg in configs {
            let pipeline = g.factory.build(cfg)?;
            g.members.push(pipeline);
        }
        debug!(members = g.members.len(), "group read");
        Ok(())
    }

    /// Incrementally synchronize the member set with a device-list
    /// snapshot, diffing by device id.
    ///
    /// Pipelines whose id vanished are closed (in parallel); configs
    /// with a new id get a pipeline built. Members whose id persists are
    /// left untouched, even if other fields of their config changed;
    /// force those through [`PipelineGroup::read`].
    pub fn update(&self, configs: &[StreamConfig]) -> Result<()> {
        let mut g = self.inner.lock().unwrap();

        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut g.members)
            .into_iter()
            .partition(|m| configs.iter().any(|c| c.id == m.id()));
        close_all(&removed);
        g.members = kept;

        for cfg in configs {
            if !g.members.iter().any(|m| m.id() == cfg.id) {
                debug!(id = cfg.id, address = %cfg.address, "adding pipeline");
                let pipeline = g.factory.build(cfg)?;
                g.members.push(pipeline);
            }
        }
        Ok(())
    }

    /// Close every member, leaving the group empty but reusable.
    pub fn reset(&self) {
        let members = {
            let mut g = self.inner.lock().unwrap();
            std::mem::take(&mut g.members)
        };
        close_all(&members);
    }

    /// Close every member and the group.
    ///
    /// Stop requests go out to all members before any member is waited
    /// on.
    pub fn close(&self) {
        self.reset();
    }
}

/// Request-stop every pipeline, then wait for each: shutdown latency is
/// the slowest member's, not the sum.
fn close_all(members: &[Arc<LivePipeline>]) {
    for member in members {
        member.request_close();
    }
    for member in members {
        if let Err(e) = member.wait_close() {
            warn!(slot = member.slot(), error = %e, "pipeline close failed");
        }
    }
}

impl Drop for PipelineGroup {
    fn drop(&mut self) {
        let members = match self.inner.get_mut() {
            Ok(g) => std::mem::take(&mut g.members),
            Err(poisoned) => std::mem::take(&mut poisoned.into_inner().members),
        };
        close_all(&members);
    }
}

impl std::fmt::Debug for PipelineGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGroup")
            .field("members", &self.len())
            .finish()
    }
}
