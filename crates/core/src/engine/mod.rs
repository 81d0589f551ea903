//! Live audio engine.
//!
//! The engine is split in two halves joined by `rtrb` rings. [`Engine`] is
//! owned by the host audio callback and renders one block per call.
//! [`EngineHandle`] stays with the graph manager, which sends it node edits
//! as commands. The render side applies every pending command at
//! the start of a block, so it never waits on the control thread, and hands
//! removed nodes back over a second ring so they are freed off the audio
//! thread.

use std::{collections::BTreeMap, fmt, sync::Arc};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::{
    analysis::AnalyserTap,
    graph::{NodeId, Output},
    processor::WaveProcessor,
};

/// Capacity of the command ring and of the ring returning retired state.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Nodes the render side holds without growing its node list.
const NODE_CAPACITY: usize = 64;

/// Block length the per-node buffers are sized for up front.
const BLOCK_CAPACITY: usize = 1024;

/// Running state behind one node identifier.
#[derive(Debug)]
pub(crate) enum Processor {
    /// Emits the host's capture block.
    Mic,
    Analyser(AnalyserTap),
    Recorder(WaveProcessor),
    Gain(f32),
    Buffer { samples: Arc<[f32]>, position: usize },
}

impl Processor {
    /// Processes one block in place. `block` holds the summed upstream signal
    /// (silence when `has_input` is false). Returns whether the node produced
    /// audio.
    fn process(&mut self, block: &mut [f32], has_input: bool, capture: Option<&[f32]>) -> bool {
        match self {
            Self::Mic => match capture {
                Some(capture) => {
                    let len = capture.len().min(block.len());
                    block[..len].copy_from_slice(&capture[..len]);
                    block[len..].fill(0.0);
                    true
                }
                None => false,
            },
            Self::Analyser(tap) => {
                tap.push(block);
                has_input
            }
            Self::Recorder(processor) => {
                processor.process(has_input.then_some(&*block));
                false
            }
            Self::Gain(gain) => {
                if has_input {
                    block.iter_mut().for_each(|sample| *sample *= *gain);
                }
                has_input
            }
            Self::Buffer { samples, position } => {
                if *position >= samples.len() {
                    return false;
                }
                let len = (samples.len() - *position).min(block.len());
                block[..len].copy_from_slice(&samples[*position..*position + len]);
                block[len..].fill(0.0);
                *position += block.len();
                true
            }
        }
    }
}

/// A node as the render side holds it.
#[derive(Debug)]
pub(crate) struct LiveNode {
    id: NodeId,
    processor: Processor,
    outputs: Vec<Output>,
    block: Vec<f32>,
    active: bool,
}

impl LiveNode {
    pub(crate) fn new(id: NodeId, processor: Processor, outputs: Vec<Output>) -> Self {
        Self {
            id,
            processor,
            outputs,
            block: Vec::with_capacity(BLOCK_CAPACITY),
            active: false,
        }
    }
}

/// Evaluation order and fan-in, computed on the control thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Routing {
    pub(crate) order: Vec<NodeId>,
    pub(crate) inputs: BTreeMap<NodeId, Vec<NodeId>>,
}

/// Node edits sent from the graph manager to the render side.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    Insert(LiveNode),
    Remove(NodeId),
    Connect { id: NodeId, outputs: Vec<Output> },
    SetGain { id: NodeId, gain: f32 },
    /// Always the last command of an update.
    Route(Routing),
}

/// State the render side no longer needs, returned to be freed.
#[derive(Debug)]
pub(crate) enum Retired {
    Node(LiveNode),
    Outputs(Vec<Output>),
    Routing(Routing),
}

/// Creates a connected handle and engine.
pub fn engine_channel(sample_rate: u32) -> (EngineHandle, Engine) {
    let (commands, command_rx) = RingBuffer::new(COMMAND_QUEUE_CAPACITY);
    let (retired_tx, retired) = RingBuffer::new(COMMAND_QUEUE_CAPACITY);
    let handle = EngineHandle {
        commands,
        retired,
        sample_rate,
    };
    let engine = Engine {
        sample_rate,
        nodes: Vec::with_capacity(NODE_CAPACITY),
        routing: Routing::default(),
        commands: command_rx,
        retired: retired_tx,
        rendered_frames: 0,
    };
    (handle, engine)
}

/// Render half of the engine, owned by the audio callback.
pub struct Engine {
    sample_rate: u32,
    nodes: Vec<LiveNode>,
    routing: Routing,
    commands: Consumer<EngineCommand>,
    retired: Producer<Retired>,
    rendered_frames: u64,
}

impl Engine {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        position(&self.nodes, id).is_some()
    }

    /// Frames rendered since the engine was created.
    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames
    }

    /// Applies every command sent so far. Called at the start of each block.
    pub fn process_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                EngineCommand::Insert(node) => {
                    if let Some(index) = position(&self.nodes, &node.id) {
                        let old = std::mem::replace(&mut self.nodes[index], node);
                        self.retire(Retired::Node(old));
                    } else {
                        self.nodes.push(node);
                    }
                }
                EngineCommand::Remove(id) => {
                    if let Some(index) = position(&self.nodes, &id) {
                        let old = self.nodes.swap_remove(index);
                        self.retire(Retired::Node(old));
                    }
                }
                EngineCommand::Connect { id, outputs } => {
                    if let Some(index) = position(&self.nodes, &id) {
                        let old = std::mem::replace(&mut self.nodes[index].outputs, outputs);
                        self.retire(Retired::Outputs(old));
                    }
                }
                EngineCommand::SetGain { id, gain } => {
                    if let Some(Processor::Gain(current)) = position(&self.nodes, &id)
                        .map(|index| &mut self.nodes[index].processor)
                    {
                        *current = gain;
                    }
                }
                EngineCommand::Route(routing) => {
                    let old = std::mem::replace(&mut self.routing, routing);
                    self.retire(Retired::Routing(old));
                }
            }
        }
    }

    /// Renders one block. `capture` is the host's microphone block, if one
    /// arrived for this callback.
    pub fn render(&mut self, capture: Option<&[f32]>, output: &mut [f32]) {
        self.process_commands();

        let frames = output.len();
        output.fill(0.0);

        let Self { nodes, routing, .. } = self;

        for id in &routing.order {
            let Some(index) = position(nodes, id) else {
                continue;
            };
            let mut block = std::mem::take(&mut nodes[index].block);
            block.clear();
            block.resize(frames, 0.0);

            let mut has_input = false;
            for source in routing.inputs.get(id).into_iter().flatten() {
                let upstream = position(nodes, source)
                    .map(|source| &nodes[source])
                    .filter(|node| node.active);
                if let Some(upstream) = upstream {
                    for (sample, incoming) in block.iter_mut().zip(&upstream.block) {
                        *sample += incoming;
                    }
                    has_input = true;
                }
            }

            let node = &mut nodes[index];
            node.active = node.processor.process(&mut block, has_input, capture);
            node.block = block;
        }

        for node in nodes.iter() {
            if node.active && node.outputs.contains(&Output::Destination) {
                for (sample, rendered) in output.iter_mut().zip(&node.block) {
                    *sample += rendered;
                }
            }
        }

        self.rendered_frames += frames as u64;
    }

    fn retire(&mut self, retired: Retired) {
        // a full ring frees in place
        let _ = self.retired.push(retired);
    }
}

fn position(nodes: &[LiveNode], id: &NodeId) -> Option<usize> {
    nodes.iter().position(|node| &node.id == id)
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("sample_rate", &self.sample_rate)
            .field("nodes", &self.nodes.len())
            .field("rendered_frames", &self.rendered_frames)
            .finish()
    }
}

/// Control half of the engine, owned by the graph manager.
pub struct EngineHandle {
    commands: Producer<EngineCommand>,
    retired: Consumer<Retired>,
    sample_rate: u32,
}

impl EngineHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Commands that fit in the ring right now.
    pub fn free_slots(&self) -> usize {
        self.commands.slots()
    }

    /// Whether the render side has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.commands.is_abandoned()
    }

    /// Queues `commands` as one unit: the render side sees all of them or
    /// none. Hands them back when the ring lacks room.
    pub(crate) fn send(
        &mut self,
        commands: Vec<EngineCommand>,
    ) -> std::result::Result<(), Vec<EngineCommand>> {
        match self.commands.write_chunk_uninit(commands.len()) {
            Ok(chunk) => {
                chunk.fill_from_iter(commands);
                Ok(())
            }
            Err(_) => Err(commands),
        }
    }

    /// Frees whatever the render side has retired. Returns how many items
    /// were collected.
    pub fn collect(&mut self) -> usize {
        let mut collected = 0;
        while self.retired.pop().is_ok() {
            collected += 1;
        }
        collected
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("sample_rate", &self.sample_rate)
            .field("free_slots", &self.commands.slots())
            .finish()
    }
}
