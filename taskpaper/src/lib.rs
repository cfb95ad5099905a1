//! Taskpaper outline library: a parsed document tree of projects, tasks and notes that can be
//! queried, edited and written back while leaving untouched regions byte-for-byte as they were.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::{
        fmt,
        ops::{Index, IndexMut},
        path::PathBuf,
    };
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /// Index of a node inside its document's arena. Only valid for the document that issued it,
    /// and only until that document is re-parsed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    impl NodeId {
        pub const ROOT: NodeId = NodeId(0);
    }

    /* ------------------------------ Node kinds ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum NodeKind {
        Document,
        Project,
        Task,
        Note,
    }

    impl NodeKind {
        /// Capability table: which operations a node of this kind accepts.
        pub fn supports(self, capability: Capability) -> bool {
            use Capability::*;
            match self {
                NodeKind::Document => matches!(capability, Projects | Tasks | Notes),
                NodeKind::Project => true,
                NodeKind::Task => !matches!(capability, Projects | Delete),
                NodeKind::Note => matches!(capability, Tags),
            }
        }
    }

    impl fmt::Display for NodeKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                NodeKind::Document => "document",
                NodeKind::Project => "project",
                NodeKind::Task => "task",
                NodeKind::Note => "note",
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Capability {
        /// List, look up and add child projects; sort projects.
        Projects,
        /// List, look up and add child tasks; sort tasks.
        Tasks,
        /// List and add notes.
        Notes,
        /// Read tags.
        Tags,
        /// Replace or extend tags.
        EditTags,
        Done,
        Delete,
    }

    impl fmt::Display for Capability {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Capability::Projects => "projects",
                Capability::Tasks => "tasks",
                Capability::Notes => "notes",
                Capability::Tags => "tags",
                Capability::EditTags => "tag editing",
                Capability::Done => "done",
                Capability::Delete => "delete",
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub enum DoneDepth {
        /// Only the node itself.
        #[default]
        Root,
        /// The node and every task and project below it.
        All,
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// A tag token without its leading `@`, e.g. `home` or `due(2016-09-04)`.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl Tag {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        /// Tag family: everything before the attribute parentheses.
        pub fn name(&self) -> &str {
            match self.0.find('(') {
                Some(idx) => &self.0[..idx],
                None => &self.0,
            }
        }

        pub fn attribute(&self) -> Option<&str> {
            let open = self.0.find('(')?;
            let inner = &self.0[open + 1..];
            Some(inner.strip_suffix(')').unwrap_or(inner))
        }

        /// Case-insensitive match. A bare query (`due`) matches the whole family; a query with an
        /// attribute (`due(friday)`) must match the full token.
        pub fn matches(&self, query: &str) -> bool {
            let query = query.trim().trim_start_matches('@').to_lowercase();
            let own = if query.contains('(') {
                self.0.as_str()
            } else {
                self.name()
            };
            own.trim().to_lowercase() == query
        }
    }

    impl AsRef<str> for Tag {
        fn as_ref(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for Tag {
        fn from(value: &str) -> Self {
            Self(value.to_string())
        }
    }

    impl PartialEq<str> for Tag {
        fn eq(&self, other: &str) -> bool {
            self.0 == other
        }
    }

    impl PartialEq<&str> for Tag {
        fn eq(&self, other: &&str) -> bool {
            self.0 == *other
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "@{}", self.0)
        }
    }

    /// Byte range into the text a document was parsed from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn slice<'a>(&self, text: &'a str) -> &'a str {
            text.get(self.start..self.end).unwrap_or("")
        }
    }

    /// The `[Searches]:` block, kept apart from the tree and always written last.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SearchBlock {
        pub header: String,
        /// Body lines relative to the header's indentation, blanks removed.
        pub body: Vec<String>,
    }

    impl SearchBlock {
        pub fn render(&self) -> Vec<String> {
            std::iter::once(self.header.clone())
                .chain(self.body.iter().cloned())
                .collect()
        }

        pub fn queries(&self) -> Vec<&str> {
            self.body.iter().map(|line| line.trim()).collect()
        }
    }

    /* ------------------------------ Arena ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NodeData {
        pub kind: NodeKind,
        /// Projects keep their trailing `:`, tasks their leading `- `. Empty for the document.
        pub title: String,
        pub tags: Vec<Tag>,
        pub parent: Option<NodeId>,
        pub children: Vec<NodeId>,
        /// Span of the node's own text (header plus body) while it is untouched.
        pub source: Option<SourceRange>,
        /// Leading whitespace width of the header line in the source.
        pub source_indent: usize,
    }

    impl NodeData {
        pub fn new(kind: NodeKind, title: &str, tags: Vec<Tag>) -> Self {
            Self {
                kind,
                title: title.to_string(),
                tags,
                parent: None,
                children: Vec::new(),
                source: None,
                source_indent: 0,
            }
        }

        /// Drop the verbatim span so the node is re-serialized from its fields.
        pub fn mark_dirty(&mut self) {
            self.source = None;
        }

        pub fn is_dirty(&self) -> bool {
            self.source.is_none()
        }

        pub fn has_tag(&self, query: &str) -> bool {
            self.tags.iter().any(|tag| tag.matches(query))
        }
    }

    /// Flat storage for one document's nodes; `NodeId::ROOT` is the document itself.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Arena {
        nodes: Vec<NodeData>,
    }

    impl Arena {
        pub fn with_root(source_len: usize) -> Self {
            let mut root = NodeData::new(NodeKind::Document, "", Vec::new());
            root.source = Some(SourceRange {
                start: 0,
                end: source_len,
            });
            Self { nodes: vec![root] }
        }

        pub fn get(&self, id: NodeId) -> Option<&NodeData> {
            self.nodes.get(id.0)
        }

        pub fn push_child(&mut self, parent: NodeId, mut data: NodeData) -> NodeId {
            let id = NodeId(self.nodes.len());
            data.parent = Some(parent);
            self.nodes.push(data);
            self.nodes[parent.0].children.push(id);
            id
        }

        pub fn children_of_kind(&self, id: NodeId, kind: NodeKind) -> Vec<NodeId> {
            self.get(id)
                .map(|node| {
                    node.children
                        .iter()
                        .copied()
                        .filter(|child| self.nodes[child.0].kind == kind)
                        .collect()
                })
                .unwrap_or_default()
        }

        /// True while the node can still be reached from the root.
        pub fn is_attached(&self, id: NodeId) -> bool {
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                if current == NodeId::ROOT {
                    return true;
                }
                cursor = match self.get(current) {
                    Some(node) => node.parent,
                    None => return false,
                };
            }
            false
        }
    }

    impl Index<NodeId> for Arena {
        type Output = NodeData;

        fn index(&self, id: NodeId) -> &NodeData {
            &self.nodes[id.0]
        }
    }

    impl IndexMut<NodeId> for Arena {
        fn index_mut(&mut self, id: NodeId) -> &mut NodeData {
            &mut self.nodes[id.0]
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum TaskpaperError {
        #[error("{kind} has no {capability}")]
        Capability {
            kind: NodeKind,
            capability: Capability,
        },
        #[error("node {0:?} is no longer part of the document")]
        Detached(NodeId),
        #[error("{line:?} does not parse as a single {expected}")]
        Malformed { expected: NodeKind, line: String },
        #[error("could not {action} the file {path:?}")]
        Io {
            action: &'static str,
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("document has no path to save to")]
        NoPath,
    }

    pub type Result<T, E = TaskpaperError> = std::result::Result<T, E>;

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tag_family_and_attribute() {
            let tag = Tag::from("due(2016-09-04)");
            assert_eq!(tag.name(), "due");
            assert_eq!(tag.attribute(), Some("2016-09-04"));
            assert!(tag.matches("@due"));
            assert!(tag.matches("DUE"));
            assert!(tag.matches("due(2016-09-04)"));
            assert!(!tag.matches("due(friday)"));
            assert!(!Tag::from("duet").matches("due"));
            assert_eq!(Tag::from("home").attribute(), None);
        }

        #[test]
        fn capability_table() {
            assert!(NodeKind::Document.supports(Capability::Projects));
            assert!(!NodeKind::Document.supports(Capability::Tags));
            assert!(!NodeKind::Document.supports(Capability::Delete));
            assert!(NodeKind::Task.supports(Capability::Done));
            assert!(!NodeKind::Task.supports(Capability::Projects));
            assert!(!NodeKind::Task.supports(Capability::Delete));
            assert!(NodeKind::Project.supports(Capability::Delete));
            assert!(NodeKind::Note.supports(Capability::Tags));
            assert!(!NodeKind::Note.supports(Capability::EditTags));
            assert!(!NodeKind::Note.supports(Capability::Tasks));
        }

        #[test]
        fn detached_nodes_are_not_reachable() {
            let mut arena = Arena::with_root(0);
            let project = arena.push_child(NodeId::ROOT, NodeData::new(NodeKind::Project, "A:", vec![]));
            let task = arena.push_child(project, NodeData::new(NodeKind::Task, "- a", vec![]));
            assert!(arena.is_attached(task));
            arena[NodeId::ROOT].children.clear();
            arena[project].parent = None;
            assert!(!arena.is_attached(task));
            assert!(!arena.is_attached(NodeId(99)));
        }
    }
}

pub mod parser {
    //! Line-oriented taskpaper parser built on `nom`.
    //!
    //! Parsing strategy:
    //! - Every line is classified on its own: search header, task (`- `), project (`title:`),
    //!   note, or blank.
    //! - A project or task header owns the following lines that are blank or indented deeper than
    //!   itself. A note owns nothing; deeper lines after a note belong to the note's parent.
    //! - Tag runs (`@home @due(friday)`) are only recognised at the end of a line, parsed with
    //!   `nom` combinators.

    use crate::core::*;
    use crate::document::Document;
    use crate::format::{indent_width, reindent};
    use crate::storage::TaskpaperParser;
    use anyhow::Context;
    use nom::{
        IResult,
        bytes::complete::{is_not, take_till},
        character::complete::{char, space0},
        combinator::{eof, opt, recognize},
        error::VerboseError,
        multi::{many0, many1},
        sequence::{delimited, preceded, terminated, tuple},
    };
    use std::path::Path;

    pub const SEARCH_HEADER: &str = "[Searches]:";

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Concrete parser implementing the `storage::TaskpaperParser` trait.
    pub struct NomTaskpaperParser;

    impl TaskpaperParser for NomTaskpaperParser {
        fn parse_file(&self, abs_path: &Path) -> anyhow::Result<Document> {
            Document::load(abs_path).with_context(|| format!("parsing {:?}", abs_path))
        }
    }

    /// Node tree plus the search block, as produced from one text buffer.
    #[derive(Debug, Clone)]
    pub struct ParsedTree {
        pub arena: Arena,
        pub searches: Option<SearchBlock>,
    }

    pub fn parse_tree(input: &str) -> ParsedTree {
        let lines = scan_lines(input);
        let mut tree = ParsedTree {
            arena: Arena::with_root(input.len()),
            searches: None,
        };
        tree.attach(input, &lines, 0, lines.len(), NodeId::ROOT);
        tree
    }

    /* ------------------------------- Tags ------------------------------- */

    /// Split a tag-string into tokens: text before the first `@` is ignored, every `@` starts a
    /// new token, tokens are trimmed and empty ones dropped.
    pub fn parse_tags(tag_string: &str) -> Vec<Tag> {
        let parsed: PResult<'_, Vec<&str>> = preceded(
            take_till(|c: char| c == '@'),
            many0(preceded(char('@'), take_till(|c: char| c == '@'))),
        )(tag_string);
        let Ok((_, tokens)) = parsed else {
            return Vec::new();
        };
        tokens
            .into_iter()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(Tag::from)
            .collect()
    }

    pub fn format_tags(tags: &[Tag]) -> String {
        tags.iter()
            .map(|tag| format!("@{}", tag.0))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Workflow / sync tag lists: separated by commas or whitespace, `@` optional, lowercased.
    /// Separators inside an attribute's parentheses belong to the attribute.
    pub fn parse_workflow_tags(list: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut depth = 0usize;
        for c in list.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' => {}
                _ if c.is_whitespace() => {}
                _ => {
                    current.push(c);
                    continue;
                }
            }
            if depth == 0 && (c == ',' || c.is_whitespace()) {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        tokens.push(current);
        tokens
            .iter()
            .map(|token| token.trim_start_matches('@').to_lowercase())
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// Values accepted wherever tags are supplied: a tag-string (`"@home @due(friday)"`) or a
    /// list of tokens with or without their leading `@`.
    pub trait IntoTags {
        fn into_tags(self) -> Vec<Tag>;
    }

    impl IntoTags for &str {
        fn into_tags(self) -> Vec<Tag> {
            parse_tags(self)
        }
    }

    impl IntoTags for String {
        fn into_tags(self) -> Vec<Tag> {
            parse_tags(&self)
        }
    }

    impl IntoTags for &String {
        fn into_tags(self) -> Vec<Tag> {
            parse_tags(self)
        }
    }

    impl<S: AsRef<str>> IntoTags for &[S] {
        fn into_tags(self) -> Vec<Tag> {
            self.iter()
                .filter_map(|token| {
                    let token = token.as_ref().trim().trim_start_matches('@').trim();
                    (!token.is_empty()).then(|| Tag::from(token))
                })
                .collect()
        }
    }

    impl<S: AsRef<str>> IntoTags for Vec<S> {
        fn into_tags(self) -> Vec<Tag> {
            self.as_slice().into_tags()
        }
    }

    impl<S: AsRef<str>, const N: usize> IntoTags for [S; N] {
        fn into_tags(self) -> Vec<Tag> {
            self.as_slice().into_tags()
        }
    }

    impl<T: IntoTags> IntoTags for Option<T> {
        fn into_tags(self) -> Vec<Tag> {
            self.map(IntoTags::into_tags).unwrap_or_default()
        }
    }

    fn tag_token(input: &str) -> PResult<'_, &str> {
        recognize(tuple((
            space0,
            char('@'),
            is_not("( \t\r\n"),
            opt(delimited(char('('), take_till(|c: char| c == ')'), char(')'))),
        )))(input)
    }

    fn tag_run(input: &str) -> PResult<'_, &str> {
        terminated(recognize(many1(tag_token)), tuple((space0, eof)))(input)
    }

    /// The tag run when `rest` is nothing but tags.
    fn trailing_tag_string(rest: &str) -> Option<&str> {
        tag_run(rest).ok().map(|(_, run)| run.trim())
    }

    /* --------------------------- Line classes --------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineClass<'a> {
        Blank,
        SearchHeader { tags: Option<&'a str> },
        Project { title: &'a str, tags: Option<&'a str> },
        Task { title: &'a str, tags: Option<&'a str> },
        Note { text: &'a str },
    }

    /// Classify one line (indentation ignored).
    pub fn classify_line(line: &str) -> LineClass<'_> {
        let text = line.trim();
        if text.is_empty() {
            return LineClass::Blank;
        }
        if let Some(rest) = text.strip_prefix(SEARCH_HEADER) {
            if rest.trim().is_empty() {
                return LineClass::SearchHeader { tags: None };
            }
            if let Some(tags) = trailing_tag_string(rest) {
                return LineClass::SearchHeader { tags: Some(tags) };
            }
        }
        if let Some(rest) = text.strip_prefix("- ") {
            let (title, tags) = split_trailing_tags(rest);
            return LineClass::Task {
                title: &text[..2 + title.len()],
                tags,
            };
        }
        if let Some((title, tags)) = project_header(text) {
            return LineClass::Project { title, tags };
        }
        LineClass::Note { text }
    }

    /// Earliest whitespace-then-`@` position from which the rest of the line is only tags.
    fn split_trailing_tags(text: &str) -> (&str, Option<&str>) {
        for (idx, _) in text.match_indices('@') {
            let head = &text[..idx];
            if !head.ends_with([' ', '\t']) {
                continue;
            }
            let title = head.trim_end();
            if title.is_empty() {
                continue;
            }
            if let Some(tags) = trailing_tag_string(&text[title.len()..]) {
                return (title, Some(tags));
            }
        }
        (text, None)
    }

    /// `title:` optionally followed by tags; the title ends at the first qualifying colon.
    fn project_header(text: &str) -> Option<(&str, Option<&str>)> {
        for (idx, _) in text.match_indices(':') {
            let rest = &text[idx + 1..];
            if rest.starts_with(|c: char| !c.is_whitespace()) {
                continue;
            }
            if rest.trim().is_empty() {
                return Some((&text[..=idx], None));
            }
            if let Some(tags) = trailing_tag_string(rest) {
                return Some((&text[..=idx], Some(tags)));
            }
        }
        None
    }

    /* ------------------------------ Tree build ------------------------------ */

    #[derive(Debug, Clone, Copy)]
    struct SourceLine<'a> {
        start: usize,
        end: usize,
        indent: usize,
        class: LineClass<'a>,
    }

    fn scan_lines(input: &str) -> Vec<SourceLine<'_>> {
        let mut out = Vec::new();
        let mut offset = 0;
        for raw in input.split_inclusive('\n') {
            let line = raw.trim_end_matches(['\n', '\r']);
            out.push(SourceLine {
                start: offset,
                end: offset + line.len(),
                indent: indent_width(line),
                class: classify_line(line),
            });
            offset += raw.len();
        }
        out
    }

    /// Exclusive end of the header at `idx`: following lines that are blank or deeper, minus
    /// trailing blanks.
    fn body_end(lines: &[SourceLine<'_>], idx: usize, end: usize) -> usize {
        let indent = lines[idx].indent;
        let mut stop = idx + 1;
        let mut last_content = idx + 1;
        while stop < end {
            let line = &lines[stop];
            if matches!(line.class, LineClass::Blank) {
                stop += 1;
                continue;
            }
            if line.indent <= indent {
                break;
            }
            stop += 1;
            last_content = stop;
        }
        last_content
    }

    impl ParsedTree {
        fn attach(
            &mut self,
            input: &str,
            lines: &[SourceLine<'_>],
            start: usize,
            end: usize,
            parent: NodeId,
        ) {
            let parent_kind = self.arena[parent].kind;
            let mut idx = start;
            while idx < end {
                let line = lines[idx];
                let text = &input[line.start..line.end];
                let (kind, title, tags) = match line.class {
                    LineClass::Blank => {
                        idx += 1;
                        continue;
                    }
                    LineClass::Note { text } => {
                        self.push_line_note(parent, &line, text);
                        idx += 1;
                        continue;
                    }
                    // Tasks cannot hold projects.
                    LineClass::Project { .. } | LineClass::SearchHeader { .. }
                        if parent_kind == NodeKind::Task =>
                    {
                        self.push_line_note(parent, &line, text.trim());
                        idx += 1;
                        continue;
                    }
                    LineClass::SearchHeader { .. } if parent == NodeId::ROOT => {
                        let stop = body_end(lines, idx, end);
                        self.absorb_searches(input, &lines[idx..stop]);
                        idx = stop;
                        continue;
                    }
                    LineClass::SearchHeader { tags } => (NodeKind::Project, SEARCH_HEADER, tags),
                    LineClass::Project { title, tags } => (NodeKind::Project, title, tags),
                    LineClass::Task { title, tags } => (NodeKind::Task, title, tags),
                };
                let stop = body_end(lines, idx, end);
                let mut data = NodeData::new(kind, title, tags.map(parse_tags).unwrap_or_default());
                data.source = Some(SourceRange {
                    start: line.start,
                    end: lines[stop - 1].end,
                });
                data.source_indent = line.indent;
                let id = self.arena.push_child(parent, data);
                self.attach(input, lines, idx + 1, stop, id);
                idx = stop;
            }
        }

        fn push_line_note(&mut self, parent: NodeId, line: &SourceLine<'_>, text: &str) {
            let mut data = NodeData::new(NodeKind::Note, text, Vec::new());
            data.source = Some(SourceRange {
                start: line.start,
                end: line.end,
            });
            data.source_indent = line.indent;
            self.arena.push_child(parent, data);
        }

        /// First root-level search header wins; later ones merge their bodies into it.
        fn absorb_searches(&mut self, input: &str, block: &[SourceLine<'_>]) {
            let Some((header, body)) = block.split_first() else {
                return;
            };
            let body: Vec<String> = body
                .iter()
                .filter(|line| !matches!(line.class, LineClass::Blank))
                .map(|line| reindent(&input[line.start..line.end], header.indent, 0))
                .collect();
            match &mut self.searches {
                Some(existing) => existing.body.extend(body),
                None => {
                    self.searches = Some(SearchBlock {
                        header: input[header.start..header.end].trim().to_string(),
                        body,
                    })
                }
            }
        }
    }

}

pub mod format {
    //! Text rendering.
    //!
    //! Two renderings exist. The canonical one (`render_canonical`) rebuilds every line from node
    //! fields with tab indentation. The buffer one (`render_buffer`) backs `content()` and saving:
    //! untouched nodes are copied from their source span (re-indented, blank lines dropped), and
    //! only edited nodes are rebuilt.

    use crate::core::*;
    use crate::parser::format_tags;
    use std::borrow::Cow;

    fn is_indent_char(c: char) -> bool {
        c == ' ' || c == '\t'
    }

    /// Leading spaces and tabs, counted per character.
    pub fn indent_width(line: &str) -> usize {
        line.chars().take_while(|c| is_indent_char(*c)).count()
    }

    /// Strip up to `strip` leading indent characters and prefix `depth` tabs.
    pub fn reindent(line: &str, strip: usize, depth: usize) -> String {
        let cut = indent_width(line).min(strip);
        let rest = match line.char_indices().nth(cut) {
            Some((offset, _)) => &line[offset..],
            None => "",
        };
        format!("{}{}", "\t".repeat(depth), rest)
    }

    /// Header line of a node, without indentation.
    pub fn render_header(node: &NodeData) -> String {
        if node.tags.is_empty() {
            node.title.clone()
        } else {
            format!("{} {}", node.title, format_tags(&node.tags))
        }
    }

    fn layout_rank(kind: NodeKind) -> u8 {
        match kind {
            NodeKind::Note => 0,
            NodeKind::Task => 1,
            NodeKind::Project => 2,
            NodeKind::Document => 3,
        }
    }

    /// Children in canonical layout order: notes, then tasks, then projects.
    pub fn canonical_children(arena: &Arena, id: NodeId) -> Vec<NodeId> {
        let mut children = arena[id].children.clone();
        children.sort_by_key(|child| layout_rank(arena[*child].kind));
        children
    }

    pub fn render_canonical(arena: &Arena, id: NodeId, depth: usize) -> Vec<String> {
        let mut out = Vec::new();
        write_canonical(arena, id, depth, &mut out);
        out
    }

    fn write_canonical(arena: &Arena, id: NodeId, depth: usize, out: &mut Vec<String>) {
        let node = &arena[id];
        let child_depth = match node.kind {
            NodeKind::Document => depth,
            _ => {
                out.push(format!("{}{}", "\t".repeat(depth), render_header(node)));
                depth + 1
            }
        };
        for child in canonical_children(arena, id) {
            write_canonical(arena, child, child_depth, out);
        }
    }

    pub fn render_buffer(arena: &Arena, source: &str, id: NodeId, depth: usize) -> Vec<String> {
        let mut out = Vec::new();
        write_buffer(arena, source, id, depth, &mut out);
        out
    }

    fn write_buffer(arena: &Arena, source: &str, id: NodeId, depth: usize, out: &mut Vec<String>) {
        let node = &arena[id];
        if let Some(range) = node.source {
            out.extend(
                range
                    .slice(source)
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| reindent(line, node.source_indent, depth)),
            );
            return;
        }
        // Document children keep their stored order; everything below is laid out canonically.
        let (children, child_depth) = match node.kind {
            NodeKind::Document => (node.children.clone(), depth),
            _ => {
                out.push(format!("{}{}", "\t".repeat(depth), render_header(node)));
                (canonical_children(arena, id), depth + 1)
            }
        };
        for child in children {
            write_buffer(arena, source, child, child_depth, out);
        }
    }

    /// Nested text of a non-document node at depth 0, header excluded.
    pub fn render_content(arena: &Arena, source: &str, id: NodeId) -> Vec<String> {
        let node = &arena[id];
        match node.source {
            Some(range) if node.kind != NodeKind::Document => {
                let body: Vec<&str> = range
                    .slice(source)
                    .lines()
                    .skip(1)
                    .filter(|line| !line.trim().is_empty())
                    .collect();
                let strip = body.iter().map(|line| indent_width(line)).min().unwrap_or(0);
                body.iter().map(|line| reindent(line, strip, 0)).collect()
            }
            _ => {
                let children = match node.kind {
                    NodeKind::Document => node.children.clone(),
                    _ => canonical_children(arena, id),
                };
                children
                    .into_iter()
                    .flat_map(|child| render_buffer(arena, source, child, 0))
                    .collect()
            }
        }
    }

    /// Replace every non-ASCII character with a space.
    pub fn to_ascii_lossy(text: &str) -> Cow<'_, str> {
        if text.is_ascii() {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(
                text.chars()
                    .map(|c| if c.is_ascii() { c } else { ' ' })
                    .collect(),
            )
        }
    }

}

pub mod document {
    //! Document aggregate: owns the arena and the text it was parsed from.
    //!
    //! Nodes are addressed by `NodeId`. Reads go through the borrowed `Node` handle, edits through
    //! `NodeMut`. Every edit marks the touched node and its ancestors dirty; untouched subtrees keep
    //! rendering from their source span.

    use crate::core::*;
    use crate::format::{
        canonical_children, render_buffer, render_canonical, render_content, render_header,
        to_ascii_lossy,
    };
    use crate::parser::{
        IntoTags, LineClass, ParsedTree, classify_line, format_tags, parse_tags, parse_tree,
        parse_workflow_tags,
    };
    use chrono::{Local, NaiveDateTime};
    use indexmap::IndexMap;
    use log::{debug, error, info};
    use serde::Serialize;
    use std::{
        fmt,
        fs::{self, File},
        io::{self, Write},
        path::{Path, PathBuf},
    };

    pub const DONE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    /* ------------------------------ Aggregate ------------------------------ */

    #[derive(Debug, Clone)]
    pub struct Document {
        pub id: DocumentId,
        /// Optional filesystem path if the document originates from disk.
        pub path: Option<PathBuf>,
        raw_content: String,
        /// Text the current arena was parsed from; source spans index into it.
        source: String,
        arena: Arena,
        searches: Option<SearchBlock>,
    }

    impl Document {
        pub fn load(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let text = fs::read_to_string(path).map_err(|source| {
                error!("could not open the file {}", path.display());
                TaskpaperError::Io {
                    action: "read",
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            debug!("loaded {} ({} bytes)", path.display(), text.len());
            Ok(Self::parse(Some(path.to_path_buf()), &text))
        }

        pub fn parse(path: Option<PathBuf>, text: &str) -> Self {
            let ParsedTree { arena, searches } = parse_tree(text);
            Self {
                id: DocumentId::new(),
                path,
                raw_content: text.to_string(),
                source: text.to_string(),
                arena,
                searches,
            }
        }

        /// The text exactly as first read.
        pub fn raw_content(&self) -> &str {
            &self.raw_content
        }

        pub fn searches(&self) -> Option<&SearchBlock> {
            self.searches.as_ref()
        }

        /// Current text: untouched regions verbatim, edited ones re-serialized, no blank lines.
        pub fn content(&self) -> String {
            let mut lines = render_buffer(&self.arena, &self.source, NodeId::ROOT, 0);
            if self.arena[NodeId::ROOT].is_dirty() {
                if let Some(searches) = &self.searches {
                    lines.extend(searches.render());
                }
            }
            lines.join("\n")
        }

        /// Re-parse the current content. Every previously issued `NodeId` becomes meaningless.
        pub fn refresh(&mut self) {
            let text = self.content();
            let ParsedTree { arena, searches } = parse_tree(&text);
            self.source = text;
            self.arena = arena;
            self.searches = searches;
        }

        pub fn root(&self) -> Node<'_> {
            Node {
                doc: self,
                id: NodeId::ROOT,
            }
        }

        pub fn node(&self, id: NodeId) -> Result<Node<'_>> {
            self.ensure_attached(id)?;
            Ok(Node { doc: self, id })
        }

        pub fn root_mut(&mut self) -> NodeMut<'_> {
            NodeMut {
                doc: self,
                id: NodeId::ROOT,
            }
        }

        pub fn node_mut(&mut self, id: NodeId) -> Result<NodeMut<'_>> {
            self.ensure_attached(id)?;
            Ok(NodeMut { doc: self, id })
        }

        pub fn snapshot(&self) -> DocumentSnapshot {
            DocumentSnapshot {
                id: self.id,
                path: self.path.clone(),
                root: self.root().snapshot(),
                searches: self
                    .searches
                    .as_ref()
                    .map(|block| block.queries().into_iter().map(str::to_string).collect())
                    .unwrap_or_default(),
            }
        }

        /* ------------------------- Root shortcuts ------------------------- */

        pub fn projects(&self) -> Vec<Node<'_>> {
            self.children_of(NodeId::ROOT, NodeKind::Project)
        }

        pub fn tasks(&self) -> Vec<Node<'_>> {
            self.children_of(NodeId::ROOT, NodeKind::Task)
        }

        pub fn notes(&self) -> Vec<Node<'_>> {
            self.children_of(NodeId::ROOT, NodeKind::Note)
        }

        pub fn get_project(&self, name: &str) -> Option<Node<'_>> {
            self.find_project(NodeId::ROOT, &project_key(name))
        }

        pub fn get_task(&self, name: &str) -> Option<Node<'_>> {
            self.find_task(NodeId::ROOT, &task_key(name))
        }

        pub fn tagged_projects(&self, tag: &str) -> Vec<Node<'_>> {
            let mut out = Vec::new();
            self.collect_tagged_projects(NodeId::ROOT, tag, &mut out);
            out
        }

        pub fn tagged_tasks(&self, tag: &str) -> Vec<Node<'_>> {
            let mut out = Vec::new();
            self.collect_tagged_tasks(NodeId::ROOT, tag, &mut out);
            out
        }

        pub fn add_project(&mut self, title: &str, tags: impl IntoTags) -> Result<NodeId> {
            self.add_project_to(NodeId::ROOT, title, tags.into_tags())
        }

        pub fn add_task(&mut self, title: &str, tags: impl IntoTags) -> Result<NodeId> {
            self.add_task_to(NodeId::ROOT, title, tags.into_tags())
        }

        pub fn add_note(&mut self, text: &str) -> Result<NodeId> {
            self.add_note_to(NodeId::ROOT, text)
        }

        pub fn sort_projects(&mut self, workflow_tags: &str) {
            let workflow = parse_workflow_tags(workflow_tags);
            self.sort_children(NodeId::ROOT, NodeKind::Project, &workflow);
        }

        pub fn sort_tasks(&mut self, workflow_tags: &str) {
            let workflow = parse_workflow_tags(workflow_tags);
            self.sort_children(NodeId::ROOT, NodeKind::Task, &workflow);
        }

        pub fn tidy(&mut self) {
            self.tidy_at(NodeId::ROOT);
        }

        /* ------------------------------ Saving ------------------------------ */

        /// Write the current content (non-ASCII replaced by spaces, trailing newline) to
        /// `copy_path`, or to the document's own path. `path` is left unchanged either way.
        pub fn save(&self, copy_path: Option<&Path>) -> Result<PathBuf> {
            let target = match copy_path.or(self.path.as_deref()) {
                Some(path) => path.to_path_buf(),
                None => return Err(TaskpaperError::NoPath),
            };
            let mut text = to_ascii_lossy(&self.content()).into_owned();
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            atomic_write(&target, &text).map_err(|source| {
                error!("could not write the file {}", target.display());
                TaskpaperError::Io {
                    action: "write",
                    path: target.clone(),
                    source,
                }
            })?;
            info!("saved {}", target.display());
            Ok(target)
        }

        /* ----------------------------- Internals ----------------------------- */

        fn handle(&self, id: NodeId) -> Node<'_> {
            Node { doc: self, id }
        }

        fn ensure_attached(&self, id: NodeId) -> Result<()> {
            if self.arena.is_attached(id) {
                Ok(())
            } else {
                Err(TaskpaperError::Detached(id))
            }
        }

        fn require(&self, id: NodeId, capability: Capability) -> Result<()> {
            self.ensure_attached(id)?;
            let kind = self.arena[id].kind;
            if kind.supports(capability) {
                Ok(())
            } else {
                Err(TaskpaperError::Capability { kind, capability })
            }
        }

        fn children_of(&self, id: NodeId, kind: NodeKind) -> Vec<Node<'_>> {
            self.arena
                .children_of_kind(id, kind)
                .into_iter()
                .map(|child| self.handle(child))
                .collect()
        }

        fn title_is(&self, id: NodeId, key: &str) -> bool {
            self.arena[id].title.to_lowercase() == key
        }

        /// Depth-first: this level first, then into each child project.
        fn find_project(&self, id: NodeId, key: &str) -> Option<Node<'_>> {
            let projects = self.arena.children_of_kind(id, NodeKind::Project);
            if let Some(hit) = projects.iter().find(|p| self.title_is(**p, key)) {
                return Some(self.handle(*hit));
            }
            projects
                .into_iter()
                .find_map(|project| self.find_project(project, key))
        }

        fn find_task(&self, id: NodeId, key: &str) -> Option<Node<'_>> {
            let tasks = self.arena.children_of_kind(id, NodeKind::Task);
            if let Some(hit) = tasks.iter().find(|t| self.title_is(**t, key)) {
                return Some(self.handle(*hit));
            }
            self.arena
                .children_of_kind(id, NodeKind::Project)
                .into_iter()
                .find_map(|project| self.find_task(project, key))
        }

        fn collect_tagged_projects<'a>(&'a self, id: NodeId, tag: &str, out: &mut Vec<Node<'a>>) {
            for project in self.arena.children_of_kind(id, NodeKind::Project) {
                if self.arena[project].has_tag(tag) {
                    out.push(self.handle(project));
                }
                self.collect_tagged_projects(project, tag, out);
            }
        }

        fn collect_tagged_tasks<'a>(&'a self, id: NodeId, tag: &str, out: &mut Vec<Node<'a>>) {
            for task in self.arena.children_of_kind(id, NodeKind::Task) {
                if self.arena[task].has_tag(tag) {
                    out.push(self.handle(task));
                }
                self.collect_tagged_tasks(task, tag, out);
            }
            for project in self.arena.children_of_kind(id, NodeKind::Project) {
                self.collect_tagged_tasks(project, tag, out);
            }
        }

        /// Mark `id` and every ancestor as edited.
        fn touch(&mut self, id: NodeId) {
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                let node = &mut self.arena[current];
                node.mark_dirty();
                cursor = node.parent;
            }
        }

        fn add_project_to(&mut self, parent: NodeId, title: &str, tags: Vec<Tag>) -> Result<NodeId> {
            let mut line = title.trim().to_string();
            if !line.ends_with(':') {
                line.push(':');
            }
            self.add_child(parent, NodeKind::Project, line, &tags)
        }

        fn add_task_to(&mut self, parent: NodeId, title: &str, tags: Vec<Tag>) -> Result<NodeId> {
            let mut line = title.trim().to_string();
            if !line.starts_with("- ") {
                line.insert_str(0, "- ");
            }
            self.add_child(parent, NodeKind::Task, line, &tags)
        }

        fn add_note_to(&mut self, parent: NodeId, text: &str) -> Result<NodeId> {
            self.add_child(parent, NodeKind::Note, text.trim().to_string(), &[])
        }

        /// Parse the would-be line back and refuse anything that does not come out as exactly one
        /// node of the expected kind with the requested tags.
        fn add_child(
            &mut self,
            parent: NodeId,
            expected: NodeKind,
            mut line: String,
            tags: &[Tag],
        ) -> Result<NodeId> {
            if !tags.is_empty() {
                line.push(' ');
                line.push_str(&format_tags(tags));
            }
            let malformed = || TaskpaperError::Malformed {
                expected,
                line: line.clone(),
            };
            if line.contains(['\n', '\r']) {
                return Err(malformed());
            }
            let data = match (expected, classify_line(&line)) {
                (NodeKind::Project, LineClass::Project { title, tags: found })
                | (NodeKind::Task, LineClass::Task { title, tags: found }) => {
                    let found = found.map(parse_tags).unwrap_or_default();
                    if found != tags {
                        return Err(malformed());
                    }
                    NodeData::new(expected, title, found)
                }
                (NodeKind::Note, LineClass::Note { text }) => {
                    NodeData::new(NodeKind::Note, text, Vec::new())
                }
                _ => return Err(malformed()),
            };
            debug!("adding {} {:?} under {:?}", expected, line, parent);
            let id = self.arena.push_child(parent, data);
            self.touch(id);
            Ok(id)
        }

        /// Replace the tags of `id`, refusing a set its header would not parse back to.
        fn retag(&mut self, id: NodeId, tags: Vec<Tag>) -> Result<()> {
            let node = &self.arena[id];
            let mut line = node.title.clone();
            if !tags.is_empty() {
                line.push(' ');
                line.push_str(&format_tags(&tags));
            }
            let found = match (node.kind, classify_line(&line)) {
                (NodeKind::Project, LineClass::Project { title, tags: found })
                | (NodeKind::Task, LineClass::Task { title, tags: found })
                    if title == node.title =>
                {
                    found.map(parse_tags).unwrap_or_default()
                }
                _ => Vec::new(),
            };
            if found != tags || line.contains(['\n', '\r']) {
                return Err(TaskpaperError::Malformed {
                    expected: node.kind,
                    line,
                });
            }
            debug!("retagging {:?} as {:?}", id, line);
            self.arena[id].tags = tags;
            self.touch(id);
            Ok(())
        }

        fn sort_children(&mut self, id: NodeId, kind: NodeKind, workflow: &[String]) {
            let current = self.arena.children_of_kind(id, kind);
            let sorted = self.bucket_order(&current, workflow);
            if sorted != current {
                debug!("reordering {} children of {:?}", kind, id);
                self.replace_children_of_kind(id, kind, &sorted);
                self.touch(id);
            }
            for child in sorted {
                self.sort_children(child, kind, workflow);
            }
            if kind == NodeKind::Task {
                for project in self.arena.children_of_kind(id, NodeKind::Project) {
                    self.sort_children(project, kind, workflow);
                }
            }
        }

        /// Stable bucketing: each node goes to the first workflow tag (in workflow order) it
        /// carries; buckets come out in workflow order, untagged nodes last.
        fn bucket_order(&self, ids: &[NodeId], workflow: &[String]) -> Vec<NodeId> {
            let mut buckets: IndexMap<&str, Vec<NodeId>> = workflow
                .iter()
                .map(|tag| (tag.as_str(), Vec::new()))
                .collect();
            let mut unmatched = Vec::new();
            for &id in ids {
                let node = &self.arena[id];
                match workflow.iter().find(|tag| node.has_tag(tag)) {
                    Some(tag) => buckets.entry(tag.as_str()).or_default().push(id),
                    None => unmatched.push(id),
                }
            }
            buckets.into_values().flatten().chain(unmatched).collect()
        }

        /// Refill the slots held by `kind` children with `sorted`, leaving other kinds in place.
        fn replace_children_of_kind(&mut self, id: NodeId, kind: NodeKind, sorted: &[NodeId]) {
            let kinds: Vec<NodeKind> = self.arena[id]
                .children
                .iter()
                .map(|child| self.arena[*child].kind)
                .collect();
            let mut replacement = sorted.iter().copied();
            for (slot, child_kind) in self.arena[id].children.iter_mut().zip(kinds) {
                if child_kind == kind {
                    if let Some(next) = replacement.next() {
                        *slot = next;
                    }
                }
            }
        }

        fn mark_done(&mut self, id: NodeId, depth: DoneDepth, stamp: &str) {
            self.arena[id].tags = vec![Tag(format!("done({stamp})"))];
            self.touch(id);
            if depth == DoneDepth::All {
                let children: Vec<NodeId> = self.arena[id]
                    .children
                    .iter()
                    .copied()
                    .filter(|child| {
                        matches!(self.arena[*child].kind, NodeKind::Project | NodeKind::Task)
                    })
                    .collect();
                for child in children {
                    self.mark_done(child, depth, stamp);
                }
            }
        }

        /// Force canonical layout for the whole subtree.
        fn tidy_at(&mut self, id: NodeId) {
            self.tidy_subtree(id);
            self.touch(id);
        }

        fn tidy_subtree(&mut self, id: NodeId) {
            let ordered = canonical_children(&self.arena, id);
            self.arena[id].children = ordered.clone();
            self.arena[id].mark_dirty();
            for child in ordered {
                self.tidy_subtree(child);
            }
        }
    }

    impl fmt::Display for Document {
        /// Canonical serialization of the whole tree, search block last.
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut lines = render_canonical(&self.arena, NodeId::ROOT, 0);
            if let Some(searches) = &self.searches {
                lines.extend(searches.render());
            }
            f.write_str(&lines.join("\n"))
        }
    }

    fn project_key(name: &str) -> String {
        let mut key = name.trim().to_lowercase();
        if !key.ends_with(':') {
            key.push(':');
        }
        key
    }

    fn task_key(name: &str) -> String {
        let key = name.trim().to_lowercase();
        if key.starts_with("- ") {
            key
        } else {
            format!("- {key}")
        }
    }

    /// Write to a sibling temp file, fsync, then rename over the target.
    fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("taskpaper.tmp");
        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|()| fs::rename(&tmp_path, path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /* ------------------------------ Read handle ------------------------------ */

    /// Borrowed view of one node.
    #[derive(Clone, Copy)]
    pub struct Node<'a> {
        doc: &'a Document,
        id: NodeId,
    }

    impl<'a> Node<'a> {
        pub fn id(&self) -> NodeId {
            self.id
        }

        pub fn kind(&self) -> NodeKind {
            self.data().kind
        }

        fn data(&self) -> &'a NodeData {
            &self.doc.arena[self.id]
        }

        /// `None` for the document itself.
        pub fn title(&self) -> Option<&'a str> {
            match self.kind() {
                NodeKind::Document => None,
                _ => Some(self.data().title.as_str()),
            }
        }

        pub fn tags(&self) -> Result<&'a [Tag]> {
            self.doc.require(self.id, Capability::Tags)?;
            Ok(self.data().tags.as_slice())
        }

        pub fn parent(&self) -> Option<Node<'a>> {
            self.data().parent.map(|parent| self.doc.handle(parent))
        }

        /// Header line (title and tags) without indentation.
        pub fn header(&self) -> String {
            render_header(self.data())
        }

        /// The node's nested text with the header removed and indentation normalised.
        pub fn content(&self) -> String {
            if self.id == NodeId::ROOT {
                return self.doc.content();
            }
            render_content(&self.doc.arena, &self.doc.source, self.id).join("\n")
        }

        /// Source text the node was parsed from; `None` once it has been edited.
        pub fn raw_content(&self) -> Option<&'a str> {
            if self.id == NodeId::ROOT {
                return Some(self.doc.raw_content());
            }
            self.data().source.map(|range| range.slice(&self.doc.source))
        }

        pub fn projects(&self) -> Result<Vec<Node<'a>>> {
            self.doc.require(self.id, Capability::Projects)?;
            Ok(self.doc.children_of(self.id, NodeKind::Project))
        }

        pub fn tasks(&self) -> Result<Vec<Node<'a>>> {
            self.doc.require(self.id, Capability::Tasks)?;
            Ok(self.doc.children_of(self.id, NodeKind::Task))
        }

        pub fn notes(&self) -> Result<Vec<Node<'a>>> {
            self.doc.require(self.id, Capability::Notes)?;
            Ok(self.doc.children_of(self.id, NodeKind::Note))
        }

        pub fn get_project(&self, name: &str) -> Result<Option<Node<'a>>> {
            self.doc.require(self.id, Capability::Projects)?;
            Ok(self.doc.find_project(self.id, &project_key(name)))
        }

        pub fn get_task(&self, name: &str) -> Result<Option<Node<'a>>> {
            self.doc.require(self.id, Capability::Tasks)?;
            Ok(self.doc.find_task(self.id, &task_key(name)))
        }

        pub fn tagged_projects(&self, tag: &str) -> Result<Vec<Node<'a>>> {
            self.doc.require(self.id, Capability::Projects)?;
            let mut out = Vec::new();
            self.doc.collect_tagged_projects(self.id, tag, &mut out);
            Ok(out)
        }

        pub fn tagged_tasks(&self, tag: &str) -> Result<Vec<Node<'a>>> {
            self.doc.require(self.id, Capability::Tasks)?;
            let mut out = Vec::new();
            self.doc.collect_tagged_tasks(self.id, tag, &mut out);
            Ok(out)
        }

        /// Canonical text of the subtree with the header at `indent` tabs.
        pub fn to_string_at(&self, indent: usize) -> String {
            let mut lines = render_canonical(&self.doc.arena, self.id, indent);
            if self.id == NodeId::ROOT {
                if let Some(searches) = &self.doc.searches {
                    lines.extend(searches.render());
                }
            }
            lines.join("\n")
        }

        /// Tree dump with children in canonical order.
        pub fn snapshot(&self) -> NodeSnapshot {
            NodeSnapshot {
                kind: self.kind(),
                title: self.title().map(str::to_string),
                tags: self.data().tags.clone(),
                children: canonical_children(&self.doc.arena, self.id)
                    .into_iter()
                    .map(|child| self.doc.handle(child).snapshot())
                    .collect(),
            }
        }
    }

    impl fmt::Debug for Node<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Node")
                .field("id", &self.id)
                .field("kind", &self.kind())
                .field("title", &self.data().title)
                .field("tags", &self.data().tags)
                .finish()
        }
    }

    impl fmt::Display for Node<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.to_string_at(0))
        }
    }

    /* ------------------------------ Edit handle ------------------------------ */

    /// Mutable access to one node of a document.
    pub struct NodeMut<'a> {
        doc: &'a mut Document,
        id: NodeId,
    }

    impl NodeMut<'_> {
        pub fn id(&self) -> NodeId {
            self.id
        }

        pub fn set_tags(&mut self, tags: impl IntoTags) -> Result<()> {
            self.doc.require(self.id, Capability::EditTags)?;
            self.doc.retag(self.id, tags.into_tags())
        }

        pub fn add_tag(&mut self, tag: &str) -> Result<()> {
            self.doc.require(self.id, Capability::EditTags)?;
            let tag = tag.trim().trim_start_matches('@');
            if tag.is_empty() {
                return Ok(());
            }
            let mut tags = self.doc.arena[self.id].tags.clone();
            tags.push(Tag::from(tag));
            self.doc.retag(self.id, tags)
        }

        pub fn add_project(&mut self, title: &str, tags: impl IntoTags) -> Result<NodeId> {
            self.doc.require(self.id, Capability::Projects)?;
            self.doc.add_project_to(self.id, title, tags.into_tags())
        }

        pub fn add_task(&mut self, title: &str, tags: impl IntoTags) -> Result<NodeId> {
            self.doc.require(self.id, Capability::Tasks)?;
            self.doc.add_task_to(self.id, title, tags.into_tags())
        }

        pub fn add_note(&mut self, text: &str) -> Result<NodeId> {
            self.doc.require(self.id, Capability::Notes)?;
            self.doc.add_note_to(self.id, text)
        }

        pub fn sort_projects(&mut self, workflow_tags: &str) -> Result<()> {
            self.doc.require(self.id, Capability::Projects)?;
            let workflow = parse_workflow_tags(workflow_tags);
            self.doc.sort_children(self.id, NodeKind::Project, &workflow);
            Ok(())
        }

        pub fn sort_tasks(&mut self, workflow_tags: &str) -> Result<()> {
            self.doc.require(self.id, Capability::Tasks)?;
            let workflow = parse_workflow_tags(workflow_tags);
            self.doc.sort_children(self.id, NodeKind::Task, &workflow);
            Ok(())
        }

        /// Replace the tags with `@done(<now>)`.
        pub fn done(&mut self, depth: DoneDepth) -> Result<()> {
            self.done_at(depth, Local::now().naive_local())
        }

        pub fn done_at(&mut self, depth: DoneDepth, when: NaiveDateTime) -> Result<()> {
            self.doc.require(self.id, Capability::Done)?;
            let stamp = when.format(DONE_FORMAT).to_string();
            debug!("marking {:?} done at {stamp}", self.id);
            self.doc.mark_done(self.id, depth, &stamp);
            Ok(())
        }

        /// Detach the node (a project) from its parent; its id is unusable afterwards.
        pub fn delete(self) -> Result<()> {
            self.doc.require(self.id, Capability::Delete)?;
            let Some(parent) = self.doc.arena[self.id].parent else {
                return Err(TaskpaperError::Detached(self.id));
            };
            debug!("deleting {:?}", self.id);
            self.doc.arena[parent].children.retain(|child| *child != self.id);
            self.doc.arena[self.id].parent = None;
            self.doc.touch(parent);
            Ok(())
        }

        pub fn tidy(&mut self) -> Result<()> {
            self.doc.ensure_attached(self.id)?;
            self.doc.tidy_at(self.id);
            Ok(())
        }
    }

    /* ------------------------------ Snapshots ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct NodeSnapshot {
        pub kind: NodeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub title: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub tags: Vec<Tag>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub children: Vec<NodeSnapshot>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct DocumentSnapshot {
        pub id: DocumentId,
        pub path: Option<PathBuf>,
        pub root: NodeSnapshot,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub searches: Vec<String>,
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn stamp() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2016, 9, 4)
                .and_then(|date| date.and_hms_opt(10, 30, 0))
                .expect("valid timestamp")
        }

        fn titles(nodes: &[Node<'_>]) -> Vec<String> {
            nodes
                .iter()
                .map(|node| node.title().unwrap_or_default().to_string())
                .collect()
        }

        #[test]
        fn done_project_keeps_children_verbatim() {
            let mut doc = Document::parse(None, "Groceries:\n\t- buy milk @home\n\t- buy bread\n");
            let tagged = doc.tagged_tasks("@home");
            assert_eq!(titles(&tagged), vec!["- buy milk"]);

            let id = doc.get_project("groceries").expect("project").id();
            doc.node_mut(id)
                .expect("node")
                .done_at(DoneDepth::Root, stamp())
                .expect("done");
            let expected = "Groceries: @done(2016-09-04 10:30:00)\n\t- buy milk @home\n\t- buy bread";
            assert_eq!(doc.to_string(), expected);
            assert_eq!(doc.content(), expected);
        }

        #[test]
        fn done_all_marks_tasks_and_projects_below() {
            let mut doc = Document::parse(None, "A:\n\t- a\n\t\t- a1\n\tnote\n\tB:\n\t\t- b\n");
            let id = doc.get_project("A").expect("project").id();
            doc.node_mut(id)
                .expect("node")
                .done_at(DoneDepth::All, stamp())
                .expect("done");
            let done = "@done(2016-09-04 10:30:00)";
            assert_eq!(
                doc.to_string(),
                format!("A: {done}\n\tnote\n\t- a {done}\n\t\t- a1 {done}\n\tB: {done}\n\t\t- b {done}")
            );
        }

        #[test]
        fn added_task_is_found_with_its_tags() {
            let mut doc = Document::parse(None, "Inbox:\n");
            let inbox = doc.get_project("Inbox").expect("inbox").id();
            let task = doc
                .node_mut(inbox)
                .expect("inbox")
                .add_task("call bank", "@phone @due(monday)")
                .expect("task");

            let fetched = doc.get_task("Call Bank").expect("task");
            assert_eq!(fetched.id(), task);
            assert_eq!(
                fetched.tags().expect("tags"),
                &[Tag::from("phone"), Tag::from("due(monday)")]
            );
            assert_eq!(fetched.parent().map(|p| p.id()), Some(inbox));
            assert_eq!(doc.content(), "Inbox:\n\t- call bank @phone @due(monday)");
        }

        #[test]
        fn rejects_lines_that_do_not_parse_back() {
            let mut doc = Document::parse(None, "");
            assert!(matches!(
                doc.add_task("x", "@bad tag"),
                Err(TaskpaperError::Malformed { expected: NodeKind::Task, .. })
            ));
            assert!(matches!(
                doc.add_project("- not a project", ""),
                Err(TaskpaperError::Malformed { .. })
            ));
            assert!(matches!(doc.add_note("- looks like a task"), Err(TaskpaperError::Malformed { .. })));
            assert!(matches!(doc.add_note("two\nlines"), Err(TaskpaperError::Malformed { .. })));
            assert_eq!(doc.content(), "");
        }

        #[test]
        fn capability_errors_name_kind_and_operation() {
            let mut doc = Document::parse(None, "- task\n\ta note\n");
            let task = doc.tasks()[0].id();
            let note = doc.node(task).expect("task").notes().expect("notes")[0].id();

            let err = doc.node(task).expect("task").projects().expect_err("tasks hold no projects");
            assert_eq!(err.to_string(), "task has no projects");
            assert!(doc.node(note).expect("note").tags().expect("note tags").is_empty());
            assert!(matches!(
                doc.node_mut(note).expect("note").add_task("x", ""),
                Err(TaskpaperError::Capability { kind: NodeKind::Note, capability: Capability::Tasks })
            ));
            assert!(matches!(
                doc.node_mut(task).expect("task").delete(),
                Err(TaskpaperError::Capability { kind: NodeKind::Task, capability: Capability::Delete })
            ));
            assert!(matches!(
                doc.root_mut().done(DoneDepth::Root),
                Err(TaskpaperError::Capability { kind: NodeKind::Document, .. })
            ));
            assert!(matches!(doc.root().tags(), Err(TaskpaperError::Capability { .. })));
        }

        #[test]
        fn deleted_projects_and_their_children_are_detached() {
            let mut doc = Document::parse(None, "A:\n\t- a\n\nB:\n\t- b\n\nC:\n");
            let b = doc.get_project("B").expect("B").id();
            let inner = doc.get_task("b").expect("b").id();
            doc.node_mut(b).expect("B").delete().expect("delete");

            assert_eq!(doc.content(), "A:\n\t- a\nC:");
            assert!(doc.get_project("B").is_none());
            assert!(matches!(doc.node(b), Err(TaskpaperError::Detached(_))));
            assert!(matches!(doc.node_mut(inner), Err(TaskpaperError::Detached(_))));

            doc.tidy();
            assert_eq!(doc.content(), "A:\n\t- a\nC:");
        }

        #[test]
        fn sort_tasks_buckets_by_workflow_order() {
            let mut doc = Document::parse(None, "- a\n- b @next\n- c @due\n- d @flag @due\n- e\n");
            doc.sort_tasks("@due, @flag, @hold, @next");
            assert_eq!(doc.content(), "- c @due\n- d @flag @due\n- b @next\n- a\n- e");
        }

        #[test]
        fn sorting_sorted_input_leaves_document_untouched() {
            let input = "- c @due\n\n- b @next\n- a\n";
            let mut doc = Document::parse(None, input);
            doc.sort_tasks("due next");
            assert!(!doc.arena[NodeId::ROOT].is_dirty());
            assert_eq!(doc.root().raw_content(), Some(input));
        }

        #[test]
        fn sort_projects_recurses_into_subprojects() {
            let mut doc = Document::parse(None, "P1:\n\tSub1:\n\tSub2: @due\nP2: @flag\n");
            doc.sort_projects("@due,@flag");
            assert_eq!(doc.content(), "P2: @flag\nP1:\n\tSub2: @due\n\tSub1:");
        }

        #[test]
        fn sort_tasks_reaches_subtasks_and_nested_projects() {
            let mut doc = Document::parse(None, "- t\n\t- x\n\t- y @flag\nP:\n\t- u\n\t- v @due\n");
            doc.sort_tasks("due flag");
            assert_eq!(doc.content(), "- t\n\t- y @flag\n\t- x\nP:\n\t- v @due\n\t- u");
        }

        #[test]
        fn tidy_is_canonical_and_idempotent() {
            let mut doc = Document::parse(None, "A:\n    - a\n    note\n\n[Searches]:\n\tDue: @due\n");
            doc.tidy();
            let once = doc.content();
            assert_eq!(once, "A:\n\tnote\n\t- a\n[Searches]:\n\tDue: @due");
            assert_eq!(once, doc.to_string());
            doc.tidy();
            assert_eq!(doc.content(), once);
        }

        #[test]
        fn canonical_text_reparses_to_the_same_tree() {
            let input = "Home: @weekend\n  - paint @due(sat)\n      mix colours\n  Garden:\n    - weed\n  a note\n- loose task\n[Searches]:\n\tDue: @due\n";
            let first = Document::parse(None, input);
            let second = Document::parse(None, &first.to_string());
            assert_eq!(first.snapshot().root, second.snapshot().root);
            assert_eq!(first.to_string(), second.to_string());
        }

        #[test]
        fn lookups_are_depth_first() {
            let doc = Document::parse(None, "A:\n\tB:\n\t\t- x\nC:\n\t- x\n- top\n");
            let x = doc.get_task("x").expect("x");
            assert_eq!(x.parent().and_then(|p| p.title()), Some("B:"));
            assert!(doc.get_task("- top").is_some());
            assert_eq!(doc.get_project("b").and_then(|p| p.title()), Some("B:"));
            assert!(doc.get_project("missing").is_none());
        }

        #[test]
        fn tagged_tasks_walk_subtasks_before_projects() {
            let doc = Document::parse(None, "- t1 @x\n\t- t1a @X\nP:\n\t- t2 @x(1)\n\tQ: @x\n");
            assert_eq!(titles(&doc.tagged_tasks("x")), vec!["- t1", "- t1a", "- t2"]);
            assert_eq!(titles(&doc.tagged_tasks("x(1)")), vec!["- t2"]);
            assert_eq!(titles(&doc.tagged_projects("@x")), vec!["Q:"]);
        }

        #[test]
        fn tags_can_be_replaced_and_extended() {
            let mut doc = Document::parse(None, "- task @old\n");
            let id = doc.tasks()[0].id();
            let mut task = doc.node_mut(id).expect("task");
            task.set_tags(["@a", "b(1)"]).expect("set");
            task.add_tag("@c").expect("add");
            assert_eq!(doc.content(), "- task @a @b(1) @c");
        }

        #[test]
        fn set_tags_rejects_tags_that_would_not_parse_back() {
            let mut doc = Document::parse(None, "- task @old\n");
            let id = doc.tasks()[0].id();
            let err = doc
                .node_mut(id)
                .expect("task")
                .set_tags(["bad tag"])
                .expect_err("space in tag");
            assert!(matches!(err, TaskpaperError::Malformed { expected: NodeKind::Task, .. }));
            assert_eq!(doc.content(), "- task @old");
            assert!(!doc.arena[id].is_dirty());
        }

        #[test]
        fn add_tag_rejects_more_than_one_tag() {
            let mut doc = Document::parse(None, "P: @x\n");
            let id = doc.projects()[0].id();
            let mut project = doc.node_mut(id).expect("project");
            let err = project.add_tag("@a @b").expect_err("two tags");
            assert!(matches!(err, TaskpaperError::Malformed { expected: NodeKind::Project, .. }));
            project.add_tag("@due(next week)").expect("attribute with a space");

            let reparsed = Document::parse(None, &doc.content());
            let tags = reparsed.projects()[0].tags().expect("tags").to_vec();
            assert_eq!(tags, doc.node(id).expect("project").tags().expect("tags").to_vec());
            assert_eq!(tags, vec![Tag::from("x"), Tag::from("due(next week)")]);
        }

        #[test]
        fn sort_matches_workflow_attributes_exactly() {
            let mut doc = Document::parse(
                None,
                "- a @due(today)\n- b @due(next week)\n- c @flag\n- d @due\n",
            );
            doc.sort_tasks("@due(next week), flag");
            assert_eq!(
                doc.content(),
                "- b @due(next week)\n- c @flag\n- a @due(today)\n- d @due"
            );
        }

        #[test]
        fn node_content_strips_header_and_indentation() {
            let doc = Document::parse(None, "A:\n\t- a\n\t\tnote\n");
            let a = doc.get_project("A").expect("A");
            assert_eq!(a.content(), "- a\n\tnote");
            assert_eq!(a.raw_content(), Some("A:\n\t- a\n\t\tnote"));
            let task = doc.get_task("a").expect("a");
            assert_eq!(task.content(), "note");
            assert_eq!(task.to_string_at(1), "\t- a\n\t\tnote");
        }

        #[test]
        fn refresh_reparses_current_content() {
            let mut doc = Document::parse(None, "A:\n");
            doc.add_task("later", "").expect("task");
            doc.refresh();
            assert!(!doc.arena[NodeId::ROOT].is_dirty());
            assert_eq!(doc.content(), "A:\n- later");
            assert_eq!(doc.raw_content(), "A:\n");
        }

        #[test]
        fn save_writes_ascii_with_trailing_newline() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("list.taskpaper");
            let copy = tmp.path().join("copy.taskpaper");
            let mut doc = Document::parse(Some(path.clone()), "Caf\u{e9}:\n\t- t\n");
            doc.add_project("Later", "").expect("project");

            assert_eq!(doc.save(None).expect("save"), path);
            assert_eq!(fs::read_to_string(&path).expect("read"), "Caf :\n\t- t\nLater:\n");
            doc.save(Some(&copy)).expect("save copy");
            assert!(copy.exists());
            assert_eq!(doc.path.as_deref(), Some(path.as_path()));

            let reloaded = Document::load(&path).expect("load");
            assert!(reloaded.get_project("later").is_some());
        }

        #[test]
        fn save_without_path_and_load_of_missing_file_fail() {
            let doc = Document::parse(None, "A:\n");
            assert!(matches!(doc.save(None), Err(TaskpaperError::NoPath)));
            let tmp = tempfile::tempdir().expect("tempdir");
            assert!(matches!(
                Document::load(tmp.path().join("missing.taskpaper")),
                Err(TaskpaperError::Io { action: "read", .. })
            ));
        }

        #[test]
        fn failed_save_leaves_no_temp_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let target = tmp.path().join("busy.taskpaper");
            fs::create_dir(&target).expect("dir");
            fs::write(target.join("keep"), "x").expect("write");

            let doc = Document::parse(None, "A:\n");
            assert!(matches!(
                doc.save(Some(&target)),
                Err(TaskpaperError::Io { action: "write", .. })
            ));
            assert!(!tmp.path().join("busy.taskpaper.tmp").exists());
            assert!(target.join("keep").exists());
        }
    }
}

pub mod settings {
    //! User settings, read from YAML.

    use crate::parser::parse_workflow_tags;
    use anyhow::{Context, Result};
    use log::debug;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub const DEFAULT_WORKFLOW_TAGS: &str = "@due, @flag, @hold, @next, @someday, @wait";
    pub const DEFAULT_SYNC_TAGS: &str = "flag, due";
    pub const DEFAULT_ARCHIVE_PROJECT: &str = "Archive";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct Settings {
        /// Sort priority, comma or space separated.
        pub workflow_tags: String,
        /// Tags that get their own document in the sync folder.
        pub sync_tags: String,
        /// Project whose `@done` tasks move to the task log.
        pub archive_project: String,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                workflow_tags: DEFAULT_WORKFLOW_TAGS.into(),
                sync_tags: DEFAULT_SYNC_TAGS.into(),
                archive_project: DEFAULT_ARCHIVE_PROJECT.into(),
            }
        }
    }

    impl Settings {
        pub fn default_path() -> Option<PathBuf> {
            dirs::config_dir().map(|dir| dir.join("taskpaper").join("taskpaper.yaml"))
        }

        pub fn from_yaml_str(text: &str) -> Result<Self> {
            if text.trim().is_empty() {
                return Ok(Self::default());
            }
            serde_yaml::from_str(text).context("parsing settings YAML")
        }

        /// An explicit path must exist; without one the default location is used when present.
        pub fn load(explicit: Option<&Path>) -> Result<Self> {
            match explicit {
                Some(path) => {
                    let text = fs::read_to_string(path)
                        .with_context(|| format!("reading settings {:?}", path))?;
                    debug!("loaded settings from {:?}", path);
                    Self::from_yaml_str(&text).with_context(|| format!("in {:?}", path))
                }
                None => match Self::default_path() {
                    Some(path) if path.is_file() => Self::load(Some(&path)),
                    _ => Ok(Self::default()),
                },
            }
        }

        pub fn write_default(path: &Path) -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            let yaml = serde_yaml::to_string(&Self::default())?;
            fs::write(path, yaml).with_context(|| format!("writing {:?}", path))
        }

        pub fn sync_tag_list(&self) -> Vec<String> {
            parse_workflow_tags(&self.sync_tags)
        }
    }

}

pub mod storage {
    use crate::document::Document;
    use anyhow::Result;
    use std::path::Path;

    /// Parsing is independent of scanning; the workspace only needs paths turned into documents.
    pub trait TaskpaperParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Document>;
    }
}

pub mod workspace {
    //! Workspace: one `.taskpaper` file, or a directory tree of them.
    //!
    //! Paths are stored relative to the workspace root (`RelPath`); the root on disk lives in
    //! `TaskpaperWorkspace::root_abs`. Documents are loaded lazily.

    use crate::document::{Document, Node};
    use crate::settings::Settings;
    use crate::storage::TaskpaperParser;
    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use log::{debug, info};
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{BTreeSet, HashSet},
        fs,
        path::{Path, PathBuf},
    };

    pub const TASKPAPER_EXTENSION: &str = "taskpaper";
    const TASK_LOG_WIDTH: usize = 120;

    /* ---------------------------- Value Objects ---------------------------- */

    /// A POSIX-like relative path from the workspace root (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct RelPath(pub String);

    impl RelPath {
        pub fn root() -> Self {
            Self("".into())
        }
        pub fn join(&self, segment: &str) -> Self {
            if self.0.is_empty() {
                Self(segment.to_string())
            } else {
                Self(format!("{}/{}", self.0, segment))
            }
        }
        pub fn file_name(&self) -> &str {
            self.0.rsplit('/').next().unwrap_or(&self.0)
        }
        pub fn file_stem(&self) -> &str {
            let name = self.file_name();
            match name.rfind('.') {
                Some(idx) if idx > 0 => &name[..idx],
                _ => name,
            }
        }
    }

    /* ----------------------------- File entries ----------------------------- */

    #[derive(Debug, Clone)]
    pub enum FileContent {
        Stub,
        Loaded(Box<Document>),
    }

    #[derive(Debug, Clone)]
    pub struct FileEntry {
        pub rel_path: RelPath,
        pub content: FileContent,
    }

    impl FileEntry {
        pub fn document(&self) -> Option<&Document> {
            match &self.content {
                FileContent::Loaded(doc) => Some(doc.as_ref()),
                FileContent::Stub => None,
            }
        }
    }

    /* ----------------------------- Workspace root ----------------------------- */

    #[derive(Debug, Clone)]
    pub struct TaskpaperWorkspace {
        pub root_abs: PathBuf,
        pub files: Vec<FileEntry>,
        pub settings: Settings,
    }

    impl TaskpaperWorkspace {
        /// Resolve `path`: a file is a one-file workspace rooted at its directory, a directory
        /// contributes every `.taskpaper` file below it.
        pub fn scan(path: &Path, settings: Settings) -> Result<Self> {
            let canonical =
                fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
            let meta = fs::metadata(&canonical)
                .with_context(|| format!("reading metadata for {:?}", canonical))?;
            let (root_abs, files) = if meta.is_dir() {
                let files = collect_taskpaper_files(&canonical)?;
                (canonical, files)
            } else {
                let parent = canonical
                    .parent()
                    .map(Path::to_path_buf)
                    .with_context(|| format!("file {:?} has no parent directory", canonical))?;
                (parent, vec![canonical])
            };
            let files = files
                .iter()
                .map(|abs| FileEntry {
                    rel_path: rel_path_of(&root_abs, abs),
                    content: FileContent::Stub,
                })
                .collect::<Vec<_>>();
            info!("workspace {:?}: {} taskpaper file(s)", root_abs, files.len());
            Ok(Self {
                root_abs,
                files,
                settings,
            })
        }

        pub fn abs_path(&self, rel_path: &RelPath) -> PathBuf {
            rel_path
                .0
                .split('/')
                .filter(|segment| !segment.is_empty())
                .fold(self.root_abs.clone(), |acc, segment| acc.join(segment))
        }

        /// Parse and hydrate every file (idempotent).
        pub fn load_all(&mut self, parser: &dyn TaskpaperParser) -> Result<()> {
            for idx in 0..self.files.len() {
                if self.files[idx].document().is_some() {
                    continue;
                }
                let abs = self.abs_path(&self.files[idx].rel_path);
                let doc = parser.parse_file(&abs)?;
                self.files[idx].content = FileContent::Loaded(Box::new(doc));
            }
            Ok(())
        }

        pub fn documents(&self) -> impl Iterator<Item = (&FileEntry, &Document)> {
            self.files
                .iter()
                .filter_map(|entry| entry.document().map(|doc| (entry, doc)))
        }

        /// Tidy, sort tasks, sort projects, save, for every file.
        pub fn sort(&self, parser: &dyn TaskpaperParser) -> Result<usize> {
            for entry in &self.files {
                let path = self.abs_path(&entry.rel_path);
                info!("sorting taskpaper file {:?}", path);
                let mut doc = parser.parse_file(&path)?;
                doc.tidy();
                doc.sort_tasks(&self.settings.workflow_tags);
                doc.sort_projects(&self.settings.workflow_tags);
                doc.save(None)
                    .with_context(|| format!("saving {:?}", path))?;
            }
            Ok(self.files.len())
        }

        /// Move the archive project's `@done` tasks of every file into its `-tasklog.md`.
        /// Returns how many files had an archive project.
        pub fn archive_done(&self, parser: &dyn TaskpaperParser) -> Result<usize> {
            let mut archived = 0;
            for entry in &self.files {
                let path = self.abs_path(&entry.rel_path);
                if self.archive_file(parser, &path)? {
                    archived += 1;
                }
            }
            Ok(archived)
        }

        fn archive_file(&self, parser: &dyn TaskpaperParser, path: &Path) -> Result<bool> {
            let mut doc = parser.parse_file(path)?;
            let Some(archive) = doc.get_project(&self.settings.archive_project) else {
                debug!("no {:?} project in {:?}", self.settings.archive_project, path);
                return Ok(false);
            };
            let archive_id = archive.id();
            let fresh: Vec<TaskLogRow> = archive
                .tagged_tasks("done")?
                .into_iter()
                .map(task_log_row)
                .collect();

            let log_path = task_log_path(path);
            let mut rows: IndexMap<String, TaskLogRow> = IndexMap::new();
            if log_path.exists() {
                let text = fs::read_to_string(&log_path)
                    .with_context(|| format!("reading {:?}", log_path))?;
                for row in parse_task_log(&text) {
                    rows.insert(row.key(), row);
                }
            }
            info!("archiving {} done task(s) from {:?}", fresh.len(), path);
            for row in fresh {
                rows.insert(row.key(), row);
            }
            let mut rows: Vec<TaskLogRow> = rows.into_values().collect();
            rows.sort_by(|a, b| {
                b.completed
                    .cmp(&a.completed)
                    .then_with(|| b.project.cmp(&a.project))
                    .then_with(|| b.task.cmp(&a.task))
            });
            fs::write(&log_path, render_task_log(&rows))
                .with_context(|| format!("writing {:?}", log_path))?;

            doc.node_mut(archive_id)?.delete()?;
            doc.save(None).with_context(|| format!("saving {:?}", path))?;
            Ok(true)
        }
    }

    /* ------------------------------- Task log ------------------------------- */

    /// One row of a `-tasklog.md` table.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TaskLogRow {
        pub task: String,
        pub completed: String,
        pub project: String,
    }

    impl TaskLogRow {
        fn key(&self) -> String {
            format!("{}\u{1f}{}\u{1f}{}", self.task, self.completed, self.project)
        }
    }

    pub fn task_log_path(taskpaper_path: &Path) -> PathBuf {
        let stem = taskpaper_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        taskpaper_path.with_file_name(format!("{stem}-tasklog.md"))
    }

    fn task_log_row(task: Node<'_>) -> TaskLogRow {
        let tags = task.tags().unwrap_or_default();
        let attribute_of = |name: &str| {
            tags.iter()
                .find(|tag| tag.name().eq_ignore_ascii_case(name))
                .and_then(|tag| tag.attribute())
                .unwrap_or_default()
                .to_string()
        };

        let mut notes = String::new();
        for note in task.notes().unwrap_or_default() {
            if !notes.is_empty() && !notes.ends_with(". ") {
                notes.push_str(if notes.ends_with('.') { " " } else { ". " });
            }
            notes.push_str(note.title().unwrap_or_default());
        }

        let title = task.title().unwrap_or_default();
        let title = title.strip_prefix("- ").unwrap_or(title);
        let mut cell = wrap_words(title, TASK_LOG_WIDTH).join("<br>");
        if !notes.is_empty() {
            cell.push_str("<br><br>**NOTES:**<br>");
            cell.push_str(&wrap_words(&notes, TASK_LOG_WIDTH).join("<br>"));
        }

        TaskLogRow {
            task: cell,
            completed: attribute_of("done"),
            project: attribute_of("project"),
        }
    }

    /// Rows of the table following the `:---` separator line.
    pub fn parse_task_log(text: &str) -> Vec<TaskLogRow> {
        let mut rows = Vec::new();
        let mut in_table = false;
        for line in text.lines() {
            if line.contains(":---") {
                in_table = true;
                continue;
            }
            if !in_table || !line.trim_start().starts_with('|') {
                continue;
            }
            let columns: Vec<&str> = line.trim().split('|').collect();
            if columns.len() < 4 {
                continue;
            }
            rows.push(TaskLogRow {
                task: columns[1].trim().to_string(),
                completed: columns[2].trim().to_string(),
                project: columns[3].trim().to_string(),
            });
        }
        rows
    }

    pub fn render_task_log(rows: &[TaskLogRow]) -> String {
        let headers = ["task", "completed", "project"];
        let mut widths = headers.map(str::len);
        for row in rows {
            widths[0] = widths[0].max(row.task.chars().count());
            widths[1] = widths[1].max(row.completed.chars().count());
            widths[2] = widths[2].max(row.project.chars().count());
        }
        let line = |cells: [&str; 3]| {
            format!(
                "| {:<w0$} | {:<w1$} | {:<w2$} |\n",
                cells[0],
                cells[1],
                cells[2],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2]
            )
        };
        let mut out = line(headers);
        out.push_str(&format!(
            "|:{}|:{}|:{}|\n",
            "-".repeat(widths[0] + 1),
            "-".repeat(widths[1] + 1),
            "-".repeat(widths[2] + 1)
        ));
        for row in rows {
            out.push_str(&line([row.task.as_str(), row.completed.as_str(), row.project.as_str()]));
        }
        out
    }

    /// Greedy word wrap; words longer than `width` are split.
    fn wrap_words(text: &str, width: usize) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            let mut word = word;
            while word.chars().count() > width {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                let split = word
                    .char_indices()
                    .nth(width)
                    .map(|(idx, _)| idx)
                    .unwrap_or(word.len());
                lines.push(word[..split].to_string());
                word = &word[split..];
            }
            if current.is_empty() {
                current.push_str(word);
            } else if current.chars().count() + 1 + word.chars().count() <= width {
                current.push(' ');
                current.push_str(word);
            } else {
                lines.push(std::mem::replace(&mut current, word.to_string()));
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
        lines
    }

    /* ------------------------------ Filesystem ------------------------------ */

    fn rel_path_of(root: &Path, abs: &Path) -> RelPath {
        let relative = abs.strip_prefix(root).unwrap_or(abs);
        relative
            .components()
            .fold(RelPath::root(), |acc, component| {
                acc.join(&component.as_os_str().to_string_lossy())
            })
    }

    fn is_taskpaper(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext == TASKPAPER_EXTENSION)
            .unwrap_or(false)
    }

    /// Every `.taskpaper` file below `dir`, sorted; symlinks are not followed.
    pub fn collect_taskpaper_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visit_dir(dir, &mut out, &mut visited)?;
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Expand CLI inputs: directories are walked, files must carry the `.taskpaper` extension.
    pub fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut visited = BTreeSet::new();
        for path in paths {
            let canonical =
                fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
            let meta = fs::metadata(&canonical)
                .with_context(|| format!("reading metadata for {:?}", canonical))?;
            if meta.is_dir() {
                debug!("scanning directory {:?}", canonical);
                for file in collect_taskpaper_files(&canonical)? {
                    if visited.insert(file.clone()) {
                        out.push(file);
                    }
                }
            } else if meta.is_file() {
                if !is_taskpaper(&canonical) {
                    anyhow::bail!("{:?} is not a .taskpaper file", canonical);
                }
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            }
        }
        Ok(out)
    }

    fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
        let canonical = fs::canonicalize(path)?;
        if !visited.insert(canonical.clone()) {
            return Ok(());
        }

        let metadata = fs::metadata(&canonical)?;
        if metadata.is_dir() {
            for entry in fs::read_dir(&canonical)? {
                let entry = entry?;
                if entry.file_type()?.is_symlink() {
                    continue;
                }
                visit_dir(&entry.path(), out, visited)?;
            }
        } else if metadata.is_file() && is_taskpaper(&canonical) {
            debug!("found taskpaper file {:?}", canonical);
            out.push(canonical);
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::NomTaskpaperParser;

        #[test]
        fn rel_paths_name_files() {
            let rel = RelPath::root().join("work").join("plan.taskpaper");
            assert_eq!(rel.0, "work/plan.taskpaper");
            assert_eq!(rel.file_name(), "plan.taskpaper");
            assert_eq!(rel.file_stem(), "plan");
        }

        #[test]
        fn scan_walks_directories_and_accepts_single_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let nested = tmp.path().join("a").join("b");
            fs::create_dir_all(&nested).expect("mkdir");
            fs::write(tmp.path().join("top.taskpaper"), "A:\n").expect("write top");
            fs::write(nested.join("deep.taskpaper"), "B:\n").expect("write deep");
            fs::write(nested.join("notes.txt"), "x").expect("write txt");

            let ws = TaskpaperWorkspace::scan(tmp.path(), Settings::default()).expect("scan dir");
            let rels: Vec<&str> = ws.files.iter().map(|f| f.rel_path.0.as_str()).collect();
            assert_eq!(rels, vec!["a/b/deep.taskpaper", "top.taskpaper"]);

            let single = TaskpaperWorkspace::scan(&nested.join("deep.taskpaper"), Settings::default())
                .expect("scan file");
            assert_eq!(single.files.len(), 1);
            assert!(single.abs_path(&single.files[0].rel_path).ends_with("b/deep.taskpaper"));

            assert!(expand_inputs(&[nested.join("notes.txt")]).is_err());
            assert_eq!(expand_inputs(&[tmp.path().to_path_buf()]).expect("expand").len(), 2);
        }

        #[test]
        fn sort_rewrites_files_in_workflow_order() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("list.taskpaper");
            fs::write(&path, "Later:\nNow: @next\n    - plain\n    - urgent @due\n").expect("write");
            let settings = Settings {
                workflow_tags: "@due, @next".into(),
                ..Settings::default()
            };
            let ws = TaskpaperWorkspace::scan(tmp.path(), settings).expect("scan");
            assert_eq!(ws.sort(&NomTaskpaperParser).expect("sort"), 1);
            assert_eq!(
                fs::read_to_string(&path).expect("read"),
                "Now: @next\n\t- urgent @due\n\t- plain\nLater:\n"
            );
        }

        #[test]
        fn archive_moves_done_tasks_into_task_log() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("work.taskpaper");
            fs::write(
                &path,
                "Inbox:\n\t- open\nArchive:\n\t- shipped @done(2016-09-05 09:00:00) @project(Launch)\n\t\tfirst note\n\t\tsecond note.\n\t\tthird\n\t- dropped\n",
            )
            .expect("write");
            let log = tmp.path().join("work-tasklog.md");
            fs::write(
                &log,
                "| task | completed | project |\n|:---|:---|:---|\n| older | 2016-09-01 08:00:00 | Launch |\n",
            )
            .expect("write log");

            let ws = TaskpaperWorkspace::scan(tmp.path(), Settings::default()).expect("scan");
            assert_eq!(ws.archive_done(&NomTaskpaperParser).expect("archive"), 1);

            assert_eq!(fs::read_to_string(&path).expect("read"), "Inbox:\n\t- open\n");
            let rows = parse_task_log(&fs::read_to_string(&log).expect("read log"));
            assert_eq!(rows.len(), 2);
            assert_eq!(
                rows[0],
                TaskLogRow {
                    task: "shipped<br><br>**NOTES:**<br>first note. second note. third".into(),
                    completed: "2016-09-05 09:00:00".into(),
                    project: "Launch".into(),
                }
            );
            assert_eq!(rows[1].task, "older");

            // Nothing left to archive.
            assert_eq!(ws.archive_done(&NomTaskpaperParser).expect("archive again"), 0);
        }

        #[test]
        fn task_log_round_trips_through_markdown() {
            let rows = vec![TaskLogRow {
                task: "a".into(),
                completed: "2016-01-01 00:00:00".into(),
                project: "".into(),
            }];
            let text = render_task_log(&rows);
            assert!(text.starts_with("| task | completed           | project |\n|:-----|"));
            assert_eq!(parse_task_log(&text), rows);
        }

        #[test]
        fn wrap_words_breaks_on_width() {
            assert_eq!(wrap_words("aa bb cc", 5), vec!["aa bb", "cc"]);
            assert_eq!(wrap_words("abcdefgh", 3), vec!["abc", "def", "gh"]);
            assert!(wrap_words("   ", 10).is_empty());
        }
    }
}

pub mod sync {
    //! Per-tag documents gathered from every file of a workspace.

    use crate::core::NodeId;
    use crate::document::{Document, Node};
    use crate::storage::TaskpaperParser;
    use crate::workspace::TaskpaperWorkspace;
    use anyhow::{Context, Result};
    use log::info;
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
    };

    /// Write `<sync_folder>/<tag>.taskpaper` for every sync tag: one project per source file,
    /// named after the file, holding that file's tagged tasks. Files inside `sync_folder` are
    /// skipped.
    pub fn sync_tagged(
        ws: &mut TaskpaperWorkspace,
        parser: &dyn TaskpaperParser,
        sync_folder: &Path,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(sync_folder).with_context(|| format!("creating {:?}", sync_folder))?;
        let sync_folder = fs::canonicalize(sync_folder)
            .with_context(|| format!("resolving path {:?}", sync_folder))?;
        ws.files
            .retain(|entry| !ws_path(&ws.root_abs, &entry.rel_path.0).starts_with(&sync_folder));
        ws.load_all(parser)?;

        let mut written = Vec::new();
        for tag in ws.settings.sync_tag_list() {
            let target = sync_folder.join(format!("{tag}.taskpaper"));
            let text = collect_tagged(ws, &tag);
            let doc = Document::parse(Some(target.clone()), &text);
            doc.save(None)?;
            info!("synced @{tag} into {:?}", target);
            written.push(target);
        }
        Ok(written)
    }

    fn ws_path(root: &Path, rel: &str) -> PathBuf {
        rel.split('/').fold(root.to_path_buf(), |acc, segment| acc.join(segment))
    }

    fn collect_tagged(ws: &TaskpaperWorkspace, tag: &str) -> String {
        let mut lines = Vec::new();
        for (entry, doc) in ws.documents() {
            let tasks = doc.tagged_tasks(tag);
            let picked: HashSet<NodeId> = tasks.iter().map(Node::id).collect();
            // A tagged subtask already travels with its tagged parent.
            let tops: Vec<&Node<'_>> = tasks
                .iter()
                .filter(|task| !has_picked_ancestor(task, &picked))
                .collect();
            if tops.is_empty() {
                continue;
            }
            lines.push(format!("{}:", entry.rel_path.file_stem()));
            lines.extend(tops.iter().map(|task| task.to_string_at(1)));
        }
        lines.join("\n")
    }

    fn has_picked_ancestor(node: &Node<'_>, picked: &HashSet<NodeId>) -> bool {
        let mut cursor = node.parent();
        while let Some(parent) = cursor {
            if picked.contains(&parent.id()) {
                return true;
            }
            cursor = parent.parent();
        }
        false
    }

}

pub use crate::core::{
    Capability, DocumentId, DoneDepth, NodeId, NodeKind, Tag, TaskpaperError,
};
pub use document::{Document, Node, NodeMut};
pub use parser::{IntoTags, NomTaskpaperParser, parse_tags};
pub use settings::Settings;
