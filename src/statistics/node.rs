// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::Value;

use super::duration::{format_time_split, parse_duration};
use super::{LogFn, StatisticError};
use crate::compare::parse_timestamp;
use crate::storage::traits::RowMap;

/// Index of a node inside its [`DataFlowTree`].
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementState {
    #[default]
    Init,
    Clicked,
}

/// Top of one flow's run.
#[derive(Debug, Clone, PartialEq)]
pub struct RootPayload {
    pub time_start: DateTime<Utc>,
    /// Log each statistic as it is recorded instead of at finish
    pub log_immediately: bool,
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticPayload {
    pub flow_group: String,
    pub flow_name: String,
    pub state_name: String,
    pub state_code: String,
    pub mode: i64,
    /// Elapsed since the root's start
    pub time_split: TimeDelta,
    pub time_start: DateTime<Utc>,
    /// Set on statistics read back from storage
    pub last_tested_date: Option<String>,
}

impl StatisticPayload {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.state_name.contains("Failure")
    }

    fn log_line(&self) -> String {
        format!("{}-{}", self.flow_name, self.state_name)
    }

    /// Flat, persisted form.
    #[must_use]
    pub fn to_map(&self) -> RowMap {
        let last_tested = self
            .last_tested_date
            .clone()
            .unwrap_or_else(|| self.time_start.to_rfc3339_opts(SecondsFormat::Secs, true));

        let mut map = RowMap::new();
        map.insert("flowGroup".into(), Value::String(self.flow_group.clone()));
        map.insert("flowName".into(), Value::String(self.flow_name.clone()));
        map.insert("stateName".into(), Value::String(self.state_name.clone()));
        map.insert("stateCode".into(), Value::String(self.state_code.clone()));
        map.insert("mode".into(), Value::from(self.mode));
        map.insert("timeSplit".into(), Value::String(format_time_split(self.time_split)));
        map.insert("lastTestedDate".into(), Value::String(last_tested));
        map
    }

    /// Inverse of [`Self::to_map`]. The four naming fields are required;
    /// an unreadable mode or time split reads as zero.
    pub fn from_map(data: &RowMap) -> Result<Self, StatisticError> {
        let text = |key: &str| -> Result<String, StatisticError> {
            match data.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                other => Err(StatisticError::Decode(format!("{}: {:?}", key, other))),
            }
        };

        let mode = match data.get("mode") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };
        let time_split = data
            .get("timeSplit")
            .and_then(Value::as_str)
            .and_then(parse_duration)
            .and_then(|d| TimeDelta::from_std(d).ok())
            .unwrap_or_else(TimeDelta::zero);
        let last_tested_date = data
            .get("lastTestedDate")
            .and_then(Value::as_str)
            .map(str::to_string);
        let time_start = last_tested_date
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_default();

        Ok(Self {
            flow_group: text("flowGroup")?,
            flow_name: text("flowName")?,
            state_name: text("stateName")?,
            state_code: text("stateCode")?,
            mode,
            time_split,
            time_start,
            last_tested_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Plain grouping node (tenant, flow group, statistic type)
    Group,
    Root(RootPayload),
    Statistic(StatisticPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TTDINode {
    pub name: String,
    pub state: ElementState,
    pub kind: NodeKind,
    children: Vec<NodeId>,
}

impl TTDINode {
    fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            state: ElementState::Init,
            kind,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub fn statistic(&self) -> Option<&StatisticPayload> {
        match &self.kind {
            NodeKind::Statistic(s) => Some(s),
            _ => None,
        }
    }
}

/// Arena holding one statistics tree. Children only ever get appended.
pub struct DataFlowTree {
    nodes: Vec<TTDINode>,
    root: NodeId,
    log: Option<LogFn>,
}

impl DataFlowTree {
    /// Start recording a flow run. The start instant is taken now.
    #[must_use]
    pub fn init_data_flow(log: Option<LogFn>, name: impl Into<String>, log_immediately: bool) -> Self {
        let root = TTDINode::new(
            name,
            NodeKind::Root(RootPayload {
                time_start: Utc::now(),
                log_immediately,
            }),
        );
        Self {
            nodes: vec![root],
            root: 0,
            log,
        }
    }

    /// Tree whose root is a plain group (used for fleets read from storage).
    #[must_use]
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            nodes: vec![TTDINode::new(name, NodeKind::Group)],
            root: 0,
            log: None,
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Name of the root node.
    #[must_use]
    pub fn name(&self) -> &str {
        self.nodes.get(self.root).map_or("", |n| n.name.as_str())
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&TTDINode> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn log_fn(&self) -> Option<&LogFn> {
        self.log.as_ref()
    }

    /// The root's payload, when the root is a flow run.
    #[must_use]
    pub fn root_payload(&self) -> Option<&RootPayload> {
        match self.nodes.get(self.root).map(|n| &n.kind) {
            Some(NodeKind::Root(p)) => Some(p),
            _ => None,
        }
    }

    fn push(&mut self, parent: NodeId, node: TTDINode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    pub fn add_group(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        self.push(parent, TTDINode::new(name, NodeKind::Group))
    }

    /// Add a flow-run node below `parent`.
    pub fn add_flow(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let payload = RootPayload {
            time_start: Utc::now(),
            log_immediately: false,
        };
        self.push(parent, TTDINode::new(name, NodeKind::Root(payload)))
    }

    #[must_use]
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(parent)?
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes.get(c).is_some_and(|n| n.name == name))
    }

    pub fn find_or_add_group(&mut self, parent: NodeId, name: &str) -> NodeId {
        match self.find_child(parent, name) {
            Some(id) => id,
            None => self.add_group(parent, name),
        }
    }

    /// Children of `id` in insertion order.
    pub fn children_of(&self, id: NodeId) -> impl Iterator<Item = &TTDINode> {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|&c| self.nodes.get(c))
    }

    /// Record a state transition with the split measured from the root's
    /// start.
    ///
    /// With `log` given, the line is logged through it right away. Otherwise
    /// the tree's own callback is used when the root asked to log
    /// immediately.
    pub fn update_data_flow_statistic(
        &mut self,
        flow_group: &str,
        flow_name: &str,
        state_name: &str,
        state_code: &str,
        mode: i64,
        log: Option<&LogFn>,
    ) {
        let time_start = self
            .root_payload()
            .map_or_else(Utc::now, |p| p.time_start);
        let split = Utc::now() - time_start;
        self.append_statistic(flow_group, flow_name, state_name, state_code, mode, split, time_start, log);
    }

    /// Record a state transition with an externally measured split.
    pub fn update_data_flow_statistic_with_time(
        &mut self,
        flow_group: &str,
        flow_name: &str,
        state_name: &str,
        state_code: &str,
        mode: i64,
        elapsed: TimeDelta,
    ) {
        let time_start = self
            .root_payload()
            .map_or_else(Utc::now, |p| p.time_start);
        self.append_statistic(flow_group, flow_name, state_name, state_code, mode, elapsed, time_start, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn append_statistic(
        &mut self,
        flow_group: &str,
        flow_name: &str,
        state_name: &str,
        state_code: &str,
        mode: i64,
        time_split: TimeDelta,
        time_start: DateTime<Utc>,
        log: Option<&LogFn>,
    ) {
        let payload = StatisticPayload {
            flow_group: flow_group.to_string(),
            flow_name: flow_name.to_string(),
            state_name: state_name.to_string(),
            state_code: state_code.to_string(),
            mode,
            time_split,
            time_start,
            last_tested_date: None,
        };

        let log = match log {
            Some(f) => Some(f),
            None if self.root_payload().is_some_and(|p| p.log_immediately) => self.log.as_ref(),
            None => None,
        };
        if let Some(f) = log {
            emit(f, &payload);
        }

        let root = self.root;
        self.push(root, TTDINode::new(String::new(), NodeKind::Statistic(payload)));
    }

    /// Statistics recorded under the root, in call order.
    #[must_use]
    pub fn statistics(&self) -> Vec<&StatisticPayload> {
        self.children_of(self.root)
            .filter_map(TTDINode::statistic)
            .collect()
    }

    /// Read a stored statistic map back in as a child of `parent`.
    pub fn map_statistic(&mut self, parent: NodeId, data: &RowMap) -> Result<NodeId, StatisticError> {
        let payload = StatisticPayload::from_map(data)?;
        Ok(self.push(parent, TTDINode::new(String::new(), NodeKind::Statistic(payload))))
    }

    /// Log every statistic at once. Only for trees that did not log as they
    /// went.
    pub fn finish_statistic_log(&self) {
        let Some(log) = self.log.as_ref() else {
            return;
        };
        if self.root_payload().is_some_and(|p| p.log_immediately) {
            return;
        }
        for stat in self.statistics() {
            emit(log, stat);
        }
    }
}

fn emit(log: &LogFn, stat: &StatisticPayload) {
    if stat.is_failure() {
        let err = StatisticError::Failure(stat.state_name.clone());
        log(&stat.log_line(), Some(&err));
    } else {
        log(&stat.log_line(), None);
    }
}

impl std::fmt::Debug for DataFlowTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlowTree")
            .field("root", &self.root)
            .field("nodes", &self.nodes)
            .field("has_log", &self.log.is_some())
            .finish()
    }
}
