//! Source positions and macro-stack traces.
//!
//! Every AST node and every expanded op carries a [`CodePosition`]. Ops
//! produced by macro expansion additionally carry a frame id into a
//! [`TraceArena`]: frames are tail-shared (each frame points at its
//! parent), so deep expansions reuse common prefixes instead of copying
//! whole call chains per op.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a source file in a [`SourceMap`].
pub type FileId = u32;

/// A position in the `.fj` sources: file, line, column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePosition {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
}

impl CodePosition {
    pub fn new(file: FileId, line: u32, column: u32) -> Self {
        CodePosition { file, line, column }
    }
}

impl fmt::Display for CodePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}:l{}:c{}", self.file, self.line, self.column)
    }
}

/// Maps file ids back to their names for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    names: Vec<String>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap { names: Vec::new() }
    }

    /// Register a file and get its id.
    pub fn add_file(&mut self, name: impl Into<String>) -> FileId {
        self.names.push(name.into());
        (self.names.len() - 1) as FileId
    }

    pub fn file_name(&self, id: FileId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Render a position with the real file name, e.g. `hello.fj:3:7`.
    pub fn describe(&self, pos: CodePosition) -> String {
        match self.file_name(pos.file) {
            Some(name) => format!("{}:{}:{}", name, pos.line, pos.column),
            None => pos.to_string(),
        }
    }
}

/// Index of a frame in a [`TraceArena`].
pub type FrameId = u32;

/// One macro invocation on the expansion stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Invocation that contains this one, if any.
    pub parent: Option<FrameId>,
    /// Rendered description, e.g. `macro bit.xor(2) (f0:l12:c5)` or
    /// `rep(i=3) macro bit.zero(1) (f1:l4:c1)`.
    pub description: String,
    /// Where the invocation was written.
    pub call_site: CodePosition,
}

/// Arena of tail-shared macro-stack frames.
#[derive(Debug, Clone, Default)]
pub struct TraceArena {
    frames: Vec<TraceFrame>,
}

impl TraceArena {
    pub fn new() -> Self {
        TraceArena { frames: Vec::new() }
    }

    pub fn push(
        &mut self,
        parent: Option<FrameId>,
        description: impl Into<String>,
        call_site: CodePosition,
    ) -> FrameId {
        self.frames.push(TraceFrame {
            parent,
            description: description.into(),
            call_site,
        });
        (self.frames.len() - 1) as FrameId
    }

    pub fn frame(&self, id: FrameId) -> Option<&TraceFrame> {
        self.frames.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The invocation chain ending at `id`, outermost first.
    pub fn chain(&self, id: FrameId) -> Vec<&TraceFrame> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(fid) = cursor {
            match self.frame(fid) {
                Some(frame) => {
                    out.push(frame);
                    cursor = frame.parent;
                }
                None => break,
            }
        }
        out.reverse();
        out
    }

    /// Render the chain ending at `id` as one line per frame.
    pub fn render(&self, id: FrameId) -> Vec<String> {
        self.chain(id)
            .iter()
            .enumerate()
            .map(|(i, frame)| format!("  {}) {}", i, frame.description))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: u32) -> CodePosition {
        CodePosition::new(0, line, 1)
    }

    #[test]
    fn test_position_display() {
        assert_eq!(pos(12).to_string(), "f0:l12:c1");
    }

    #[test]
    fn test_source_map_describe() {
        let mut map = SourceMap::new();
        let id = map.add_file("hello.fj");
        assert_eq!(map.file_name(id), Some("hello.fj"));
        assert_eq!(map.describe(CodePosition::new(id, 3, 7)), "hello.fj:3:7");
    }

    #[test]
    fn test_chain_order_and_sharing() {
        let mut arena = TraceArena::new();
        let a = arena.push(None, "macro outer", pos(1));
        let b = arena.push(Some(a), "macro middle", pos(2));
        let c1 = arena.push(Some(b), "macro leaf", pos(3));
        let c2 = arena.push(Some(b), "macro leaf", pos(4));

        let chain = arena.chain(c1);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].description, "macro outer");
        assert_eq!(chain[2].description, "macro leaf");

        // Two leaves share the same prefix frames.
        assert_eq!(arena.chain(c2)[0].description, "macro outer");
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn test_render_is_indexed() {
        let mut arena = TraceArena::new();
        let a = arena.push(None, "macro outer", pos(1));
        let b = arena.push(Some(a), "macro inner", pos(2));
        let lines = arena.render(b);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  0) "));
        assert!(lines[1].contains("inner"));
    }
}
