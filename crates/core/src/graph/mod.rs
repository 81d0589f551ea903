//! Declarative audio graph.
//!
//! Callers describe the complete desired routing as a [`NodeSet`] every time
//! something changes. [`GraphManager::update`] diffs it against the last
//! applied set and touches only the nodes that differ, so sources that are
//! already sounding keep playing.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{
    analysis::{analyser_channel, AnalyserFeed, AnalyserNode, MAX_FFT_SIZE, MIN_FFT_SIZE},
    engine::{EngineCommand, EngineHandle, LiveNode, Processor, Routing},
    processor::{recorder_channel, Batch, RecorderPort},
    timeline::sample_index,
    AnalyserConfig, DublineError, Result,
};

/// Stable identifier of a node across updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn mic() -> Self {
        Self::new("mic")
    }

    pub fn analyser() -> Self {
        Self::new("analyser")
    }

    pub fn recorder() -> Self {
        Self::new("recorder")
    }

    pub fn playthrough() -> Self {
        Self::new("playthrough")
    }

    pub fn volume() -> Self {
        Self::new("volume")
    }

    /// Playback source for a track, unique to the playback run that started
    /// it so later updates never retarget a buffer that is already playing.
    pub fn track(index: usize, mark_timestamp_ms: f64) -> Self {
        Self(format!("track-{index}-{mark_timestamp_ms}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a node sends its signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Node(NodeId),
    /// The physical output.
    Destination,
    /// Consumed without being heard.
    Discard,
}

/// Audible sink.
pub const OUTPUT: Output = Output::Destination;
/// Silent sink for taps.
pub const NO_OUTPUT: Output = Output::Discard;

impl Output {
    pub fn node(id: NodeId) -> Self {
        Self::Node(id)
    }

    pub fn target(&self) -> Option<&NodeId> {
        match self {
            Self::Node(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Live microphone input. `stream` identifies the opened capture stream;
    /// a new stream replaces the node.
    MicSource { stream: u64 },
    Analyser { fft_size: usize },
    /// Capture tap. `run` identifies the playback run it records; a new run
    /// replaces the tap so chunks from the previous run are recognisably
    /// stale.
    Recorder { chunk_len: usize, run: u64 },
    Gain { gain: f32 },
    BufferSource { buffer: Arc<[f32]>, offset_time: f64 },
}

impl NodeKind {
    /// Whether `other` can be applied to a live node of this kind by
    /// retuning rather than recreating it.
    fn same_instance(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::MicSource { stream: a }, Self::MicSource { stream: b }) => a == b,
            (Self::Analyser { fft_size: a }, Self::Analyser { fft_size: b }) => a == b,
            (
                Self::Recorder {
                    chunk_len: a,
                    run: ar,
                },
                Self::Recorder {
                    chunk_len: b,
                    run: br,
                },
            ) => a == b && ar == br,
            (Self::Gain { .. }, Self::Gain { .. }) => true,
            (
                Self::BufferSource {
                    buffer: a,
                    offset_time: at,
                },
                Self::BufferSource {
                    buffer: b,
                    offset_time: bt,
                },
            ) => Arc::ptr_eq(a, b) && at == bt,
            _ => false,
        }
    }
}

impl PartialEq for NodeKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Gain { gain: a }, Self::Gain { gain: b }) => a == b,
            _ => self.same_instance(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub kind: NodeKind,
    pub outputs: Vec<Output>,
}

impl NodeDescriptor {
    pub fn new(kind: NodeKind, outputs: Vec<Output>) -> Self {
        Self { kind, outputs }
    }

    pub fn mic(outputs: Vec<Output>, stream: u64) -> Self {
        Self::new(NodeKind::MicSource { stream }, outputs)
    }

    pub fn analyser(outputs: Vec<Output>, fft_size: usize) -> Self {
        Self::new(NodeKind::Analyser { fft_size }, outputs)
    }

    pub fn recorder(outputs: Vec<Output>, chunk_len: usize, run: u64) -> Self {
        Self::new(NodeKind::Recorder { chunk_len, run }, outputs)
    }

    pub fn gain(outputs: Vec<Output>, gain: f32) -> Self {
        Self::new(NodeKind::Gain { gain }, outputs)
    }

    pub fn buffer_source(outputs: Vec<Output>, buffer: Arc<[f32]>, offset_time: f64) -> Self {
        Self::new(NodeKind::BufferSource { buffer, offset_time }, outputs)
    }
}

/// Complete desired routing, keyed by node identifier.
pub type NodeSet = BTreeMap<NodeId, NodeDescriptor>;

/// Identifiers that differ between two node sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDiff {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Same identifier, but the node must be recreated.
    pub replaced: Vec<NodeId>,
    /// Same node, new gain.
    pub retuned: Vec<NodeId>,
    /// Same node, new connections.
    pub rewired: Vec<NodeId>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.replaced.is_empty()
            && self.retuned.is_empty()
            && self.rewired.is_empty()
    }
}

pub fn diff(current: &NodeSet, desired: &NodeSet) -> GraphDiff {
    let mut diff = GraphDiff {
        removed: current
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect(),
        ..GraphDiff::default()
    };

    for (id, wanted) in desired {
        let Some(live) = current.get(id) else {
            diff.added.push(id.clone());
            continue;
        };
        if !live.kind.same_instance(&wanted.kind) {
            diff.replaced.push(id.clone());
            continue;
        }
        if live.kind != wanted.kind {
            diff.retuned.push(id.clone());
        }
        if live.outputs != wanted.outputs {
            diff.rewired.push(id.clone());
        }
    }

    diff
}

/// Orders nodes so every node comes after all of its sources. Fails on
/// connections to unknown nodes and on cycles.
pub(crate) fn topological_order(edges: &BTreeMap<NodeId, Vec<NodeId>>) -> Result<Vec<NodeId>> {
    let mut indegree: BTreeMap<&NodeId, usize> = edges.keys().map(|id| (id, 0)).collect();
    for (from, targets) in edges {
        for target in targets {
            match indegree.get_mut(target) {
                Some(degree) => *degree += 1,
                None => {
                    return Err(DublineError::Graph(format!(
                        "`{from}` connects to unknown node `{target}`"
                    )))
                }
            }
        }
    }

    let mut ready: VecDeque<&NodeId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        for target in edges.get(id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(target) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(target);
                }
            }
        }
    }

    if order.len() != edges.len() {
        return Err(DublineError::Graph("node set contains a cycle".to_string()));
    }
    Ok(order)
}

/// Evaluation order plus the sources feeding each node.
pub(crate) fn routing(edges: &BTreeMap<NodeId, Vec<NodeId>>) -> Result<Routing> {
    let order = topological_order(edges)?;
    let mut inputs: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for (from, targets) in edges {
        for target in targets {
            inputs.entry(target.clone()).or_default().push(from.clone());
        }
    }
    Ok(Routing { order, inputs })
}

/// Checks `desired` and derives the routing the engine will run with.
fn plan(desired: &NodeSet) -> Result<Routing> {
    for (id, descriptor) in desired {
        match &descriptor.kind {
            NodeKind::Gain { gain } if !gain.is_finite() => {
                return Err(DublineError::Graph(format!("`{id}` has a non-finite gain")));
            }
            NodeKind::Analyser { fft_size }
                if !fft_size.is_power_of_two()
                    || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(fft_size) =>
            {
                return Err(DublineError::Graph(format!(
                    "`{id}` has an invalid fft size {fft_size}"
                )));
            }
            NodeKind::Recorder { chunk_len: 0, .. } => {
                return Err(DublineError::Graph(format!("`{id}` has an empty chunk")));
            }
            _ => {}
        }
    }

    let edges = desired
        .iter()
        .map(|(id, descriptor)| {
            let targets = descriptor
                .outputs
                .iter()
                .filter_map(Output::target)
                .cloned()
                .collect();
            (id.clone(), targets)
        })
        .collect();
    routing(&edges)
}

/// Result of [`GraphManager::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// No engine yet, or no room to send the edits; retry later.
    Deferred,
    Applied(GraphDiff),
}

/// Control-side state created with new nodes, registered only once the
/// edits reach the engine.
#[derive(Default)]
struct Staged {
    ports: Vec<RecorderPort>,
    taps: Vec<(NodeId, u64)>,
    feeds: Vec<(NodeId, AnalyserFeed)>,
}

/// Reconciles declarative node sets against the live engine.
#[derive(Debug)]
pub struct GraphManager {
    engine: Option<EngineHandle>,
    applied: NodeSet,
    ports: Vec<RecorderPort>,
    taps: BTreeMap<NodeId, u64>,
    analysers: BTreeMap<NodeId, AnalyserFeed>,
    next_tap: u64,
    queue_capacity: usize,
    analyser: AnalyserConfig,
}

impl GraphManager {
    pub fn new(queue_capacity: usize, analyser: AnalyserConfig) -> Self {
        Self {
            engine: None,
            applied: NodeSet::new(),
            ports: Vec::new(),
            taps: BTreeMap::new(),
            analysers: BTreeMap::new(),
            next_tap: 0,
            queue_capacity,
            analyser,
        }
    }

    /// Attaches the control half of a freshly created engine. Nothing is
    /// live on it yet, so the next update builds the whole set.
    pub fn attach(&mut self, engine: EngineHandle) {
        tracing::info!(sample_rate = engine.sample_rate(), "audio engine attached");
        self.engine = Some(engine);
        self.applied.clear();
        self.taps.clear();
        self.analysers.clear();
    }

    pub fn detach(&mut self) -> Option<EngineHandle> {
        self.applied.clear();
        self.taps.clear();
        self.analysers.clear();
        self.engine.take()
    }

    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.as_ref()
    }

    /// The set most recently sent to the engine.
    pub fn applied(&self) -> &NodeSet {
        &self.applied
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.applied.contains_key(id)
    }

    /// Whether batches stamped with `tap` come from a recorder still in the
    /// graph.
    pub fn is_tap_live(&self, tap: u64) -> bool {
        self.taps.values().any(|&live| live == tap)
    }

    /// Brings the engine in line with `desired`. Updates are serialised by
    /// `&mut self`; an invalid set is rejected before anything changes. The
    /// edits reach the engine as one unit at the start of its next block.
    pub fn update(&mut self, desired: &NodeSet) -> Result<UpdateOutcome> {
        let Some(sample_rate) = self.engine.as_ref().map(EngineHandle::sample_rate) else {
            tracing::debug!("no audio engine yet, graph update deferred");
            return Ok(UpdateOutcome::Deferred);
        };

        let routing = plan(desired)?;
        let diff = diff(&self.applied, desired);
        if diff.is_empty() {
            return Ok(UpdateOutcome::Applied(diff));
        }

        let mut staged = Staged::default();
        let mut commands = Vec::new();
        for id in diff.removed.iter().chain(&diff.replaced) {
            commands.push(EngineCommand::Remove(id.clone()));
        }
        for id in diff.added.iter().chain(&diff.replaced) {
            if let Some(descriptor) = desired.get(id) {
                let processor = self.instantiate(id, &descriptor.kind, sample_rate, &mut staged)?;
                commands.push(EngineCommand::Insert(LiveNode::new(
                    id.clone(),
                    processor,
                    descriptor.outputs.clone(),
                )));
            }
        }
        for id in &diff.retuned {
            if let Some(NodeKind::Gain { gain }) = desired.get(id).map(|d| &d.kind) {
                commands.push(EngineCommand::SetGain {
                    id: id.clone(),
                    gain: *gain,
                });
            }
        }
        for id in &diff.rewired {
            if let Some(descriptor) = desired.get(id) {
                commands.push(EngineCommand::Connect {
                    id: id.clone(),
                    outputs: descriptor.outputs.clone(),
                });
            }
        }
        commands.push(EngineCommand::Route(routing));

        let Some(handle) = self.engine.as_mut() else {
            return Ok(UpdateOutcome::Deferred);
        };
        handle.collect();
        if let Err(unsent) = handle.send(commands) {
            tracing::debug!(
                commands = unsent.len(),
                free = handle.free_slots(),
                "engine command queue full, graph update deferred"
            );
            return Ok(UpdateOutcome::Deferred);
        }

        for id in diff.removed.iter().chain(&diff.replaced) {
            self.taps.remove(id);
            self.analysers.remove(id);
        }
        self.ports.extend(staged.ports);
        self.taps.extend(staged.taps);
        self.analysers.extend(staged.feeds);

        tracing::debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            replaced = diff.replaced.len(),
            retuned = diff.retuned.len(),
            rewired = diff.rewired.len(),
            "audio graph updated"
        );
        self.applied = desired.clone();
        Ok(UpdateOutcome::Applied(diff))
    }

    /// Everything the recorder taps have emitted since the last call, live
    /// or not. Queues of removed taps are released once empty.
    pub fn drain_recorders(&mut self) -> Vec<Batch> {
        if let Some(handle) = self.engine.as_mut() {
            handle.collect();
        }
        let mut batches = Vec::new();
        for port in &mut self.ports {
            batches.extend(port.drain());
        }
        let taps = &self.taps;
        self.ports
            .retain(|port| taps.values().any(|&tap| tap == port.tap()) || !port.is_abandoned());
        batches
    }

    /// Returns a consumed batch's buffer to the tap that produced it.
    pub fn recycle(&mut self, batch: Batch) {
        if let Some(port) = self.ports.iter_mut().find(|port| port.tap() == batch.tap) {
            port.recycle(batch);
        }
    }

    /// Moves rendered audio into every live analyser's history.
    pub fn drain_analysers(&mut self) {
        self.analysers.values_mut().for_each(AnalyserFeed::sync);
    }

    /// The analyser behind `id`, brought up to date.
    pub fn analyser_mut(&mut self, id: &NodeId) -> Option<&mut AnalyserNode> {
        self.analysers.get_mut(id).map(AnalyserFeed::analyser_mut)
    }

    fn instantiate(
        &mut self,
        id: &NodeId,
        kind: &NodeKind,
        sample_rate: u32,
        staged: &mut Staged,
    ) -> Result<Processor> {
        Ok(match kind {
            NodeKind::MicSource { .. } => Processor::Mic,
            NodeKind::Analyser { fft_size } => {
                let config = AnalyserConfig {
                    fft_size: *fft_size,
                    ..self.analyser.clone()
                };
                let node = AnalyserNode::with_config(&config)?;
                let (tap, feed) = analyser_channel(node, sample_rate as usize / 2);
                staged.feeds.push((id.clone(), feed));
                Processor::Analyser(tap)
            }
            NodeKind::Recorder { chunk_len, .. } => {
                self.next_tap += 1;
                let tap = self.next_tap;
                let (processor, port) = recorder_channel(*chunk_len, self.queue_capacity, tap);
                staged.ports.push(port);
                staged.taps.push((id.clone(), tap));
                Processor::Recorder(processor)
            }
            NodeKind::Gain { gain } => Processor::Gain(*gain),
            NodeKind::BufferSource {
                buffer,
                offset_time,
            } => Processor::Buffer {
                samples: buffer.clone(),
                position: sample_index(*offset_time, sample_rate),
            },
        })
    }
}
