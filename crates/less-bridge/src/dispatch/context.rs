//! Read access to the host's evaluation frames during a call.
use std::hash::{Hash, Hasher};

use less_flat::Node;
use rustc_hash::{FxHashMap, FxHasher};

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Node,
    pub important: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Node) -> Self {
        Self {
            name: name.into(),
            value,
            important: false,
        }
    }

    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }
}

/// The host evaluator's frame stack. Depth 0 is the innermost frame.
pub trait EvalContext: Send + Sync {
    fn frame_count(&self) -> usize;

    /// An identity for the frame at `depth`, stable while that frame is alive.
    fn frame_id(&self, depth: usize) -> u64;

    fn lookup(&self, depth: usize, name: &str) -> Option<Variable>;
}

/// Walks outward from `start_depth` and returns the first definition of `name`.
pub fn resolve_from(ctx: &dyn EvalContext, start_depth: usize, name: &str) -> Option<Variable> {
    (start_depth..ctx.frame_count()).find_map(|depth| ctx.lookup(depth, name))
}

/// Cheap identity of a context, used to tell whether preloaded values are still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextFingerprint {
    frames: usize,
    hash: u64,
}

impl ContextFingerprint {
    pub fn of(ctx: &dyn EvalContext) -> Self {
        let frames = ctx.frame_count();
        let mut hasher = FxHasher::default();
        for depth in 0..frames {
            ctx.frame_id(depth).hash(&mut hasher);
        }
        Self {
            frames,
            hash: hasher.finish(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Frame {
    id: u64,
    vars: FxHashMap<String, Variable>,
}

/// A plain in-memory [`EvalContext`].
#[derive(Debug, Clone, Default)]
pub struct FrameStack {
    // Outermost first.
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a new innermost frame.
    pub fn push_frame(&mut self, id: u64) -> &mut Self {
        self.frames.push(Frame {
            id,
            vars: FxHashMap::default(),
        });
        self
    }

    pub fn pop_frame(&mut self) -> Option<u64> {
        self.frames.pop().map(|frame| frame.id)
    }

    /// Defines `var` in the innermost frame, entering a frame with id 0 if there is none.
    pub fn define(&mut self, var: Variable) -> &mut Self {
        if self.frames.is_empty() {
            self.push_frame(0);
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.vars.insert(var.name.clone(), var);
        }
        self
    }

    fn frame(&self, depth: usize) -> Option<&Frame> {
        self.frames.len().checked_sub(depth + 1).and_then(|i| self.frames.get(i))
    }
}

impl EvalContext for FrameStack {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame_id(&self, depth: usize) -> u64 {
        self.frame(depth).map_or(0, |frame| frame.id)
    }

    fn lookup(&self, depth: usize, name: &str) -> Option<Variable> {
        self.frame(depth).and_then(|frame| frame.vars.get(name)).cloned()
    }
}
