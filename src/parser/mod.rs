//! Parser integration boundary
//!
//! A parsed translation unit is an arena of cursors. Each cursor carries a
//! location, a classification ([`AstNodeId`]), a USR and, for use sites, a
//! link to the declaration it references. The indexer only ever talks to
//! parsers through [`SourceParser`] and walks units with [`traverse`], so any
//! backend that can fill the arena plugs in. The bundled backend is
//! [`cpp::CppParser`], built on Tree-sitter.

pub mod args;
pub mod cpp;

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::SourceLocation;

pub use args::CompilerArgs;
pub use cpp::CppParser;

/// Node classification taxonomy exposed by the parser
///
/// Use sites carry the classification of the declaration they reference,
/// except macro uses which are always [`AstNodeId::MacroInstantiation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstNodeId {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    EnumValue,
    Union,
    Typedef,
    /// Any variable declaration, file-scope variables included
    LocalVariable,
    FunctionParameter,
    Field,
    MacroDefinition,
    MacroInstantiation,
    Namespace,
    TranslationUnit,
    /// Nodes the classifier does not expose (template parameters, ...)
    Unexposed,
}

/// Signal returned by a visitor for each node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildVisit {
    /// Skip this node's children and move on to its next sibling
    Continue,
    /// Descend into this node's children
    Recurse,
}

/// Index of a cursor inside its translation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(u32);

impl CursorId {
    pub const ROOT: CursorId = CursorId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Raw cursor payload stored in the arena
#[derive(Debug, Clone)]
pub struct CursorData {
    pub kind: AstNodeId,
    pub spelling: String,
    /// Own identity; empty for pure use sites
    pub usr: String,
    pub location: SourceLocation,
    pub referenced: Option<CursorId>,
    /// Exclusive end column of the cursor's token on `location.line`
    pub extent_end: u32,
    children: Vec<CursorId>,
}

impl CursorData {
    pub fn new(
        kind: AstNodeId,
        spelling: impl Into<String>,
        usr: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        let spelling = spelling.into();
        let extent_end = location.column + (spelling.len().max(1) as u32);
        Self {
            kind,
            spelling,
            usr: usr.into(),
            location,
            referenced: None,
            extent_end,
            children: Vec::new(),
        }
    }

    pub fn with_referenced(mut self, declaration: CursorId) -> Self {
        self.referenced = Some(declaration);
        self
    }
}

/// One parsed source file with its includes expanded
#[derive(Debug)]
pub struct TranslationUnit {
    spelling: PathBuf,
    nodes: Vec<CursorData>,
    definitions: HashMap<String, CursorId>,
}

impl TranslationUnit {
    /// Create an empty unit whose primary file is `spelling`
    pub fn new(spelling: impl Into<PathBuf>) -> Self {
        let spelling = spelling.into();
        let root = CursorData::new(
            AstNodeId::TranslationUnit,
            spelling.to_string_lossy(),
            "",
            SourceLocation::new(spelling.clone(), 1, 1),
        );
        Self {
            spelling,
            nodes: vec![root],
            definitions: HashMap::new(),
        }
    }

    /// Primary file of the unit
    pub fn spelling(&self) -> &Path {
        &self.spelling
    }

    pub fn root(&self) -> Cursor<'_> {
        self.cursor(CursorId::ROOT)
    }

    pub fn cursor(&self, id: CursorId) -> Cursor<'_> {
        Cursor { unit: self, id }
    }

    /// Number of cursors, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn add_child(&mut self, parent: CursorId, data: CursorData) -> CursorId {
        let id = CursorId(self.nodes.len() as u32);
        self.nodes.push(data);
        self.nodes[parent.index()].children.push(id);
        id
    }

    /// Record `cursor` as the defining declaration of `usr`
    pub fn set_definition(&mut self, usr: impl Into<String>, cursor: CursorId) {
        self.definitions.insert(usr.into(), cursor);
    }

    /// Every cursor except the root, in creation order
    pub fn cursors(&self) -> impl Iterator<Item = Cursor<'_>> {
        (1..self.nodes.len()).map(|index| self.cursor(CursorId(index as u32)))
    }

    pub(crate) fn data(&self, id: CursorId) -> &CursorData {
        &self.nodes[id.index()]
    }

    /// Cursor whose token covers (line, column) in the primary file
    pub fn cursor_at(&self, line: u32, column: u32) -> Option<Cursor<'_>> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, data)| {
                data.location.line == line
                    && data.location.column <= column
                    && column < data.extent_end
                    && data.location.file == self.spelling
            })
            .map(|(index, _)| self.cursor(CursorId(index as u32)))
    }

    /// Definition of whatever the cursor at (line, column) declares or references
    pub fn definition_at(&self, line: u32, column: u32) -> Option<Cursor<'_>> {
        self.cursor_at(line, column)?.definition()
    }
}

/// Borrowed handle to one node of a translation unit
#[derive(Clone, Copy)]
pub struct Cursor<'tu> {
    unit: &'tu TranslationUnit,
    id: CursorId,
}

impl<'tu> Cursor<'tu> {
    pub fn id(&self) -> CursorId {
        self.id
    }

    fn data(&self) -> &'tu CursorData {
        self.unit.data(self.id)
    }

    /// Classification of this node (`get_ast_node_id`)
    pub fn kind(&self) -> AstNodeId {
        self.data().kind
    }

    pub fn spelling(&self) -> &'tu str {
        &self.data().spelling
    }

    pub fn usr(&self) -> &'tu str {
        &self.data().usr
    }

    pub fn location(&self) -> &'tu SourceLocation {
        &self.data().location
    }

    /// Declaration this node refers to, if it is a use site
    pub fn referenced(&self) -> Option<Cursor<'tu>> {
        self.data().referenced.map(|id| self.unit.cursor(id))
    }

    /// Identity that unifies a declaration with its uses
    pub fn identity(&self) -> &'tu str {
        match self.referenced() {
            Some(declaration) => declaration.usr(),
            None => self.usr(),
        }
    }

    /// Defining declaration of this node (or of what it references)
    pub fn definition(&self) -> Option<Cursor<'tu>> {
        let usr = self.identity();
        if usr.is_empty() {
            return None;
        }
        self.unit.definitions.get(usr).map(|id| self.unit.cursor(*id))
    }

    pub fn children(self) -> impl Iterator<Item = Cursor<'tu>> + 'tu {
        let unit = self.unit;
        self.data().children.iter().map(move |id| unit.cursor(*id))
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("kind", &self.kind())
            .field("spelling", &self.spelling())
            .field("location", &self.location().to_string())
            .finish()
    }
}

/// Per-node callback of a depth-first walk
///
/// The implementor is the walk's context: whatever the walk accumulates
/// lives in the visitor itself.
pub trait AstVisitor {
    fn visit(&mut self, cursor: Cursor<'_>, parent: Cursor<'_>) -> ChildVisit;
}

/// Depth-first, pre-order walk over the descendants of `root`
///
/// `root` itself is not visited. Children of a node are only visited when
/// the visitor returns [`ChildVisit::Recurse`] for it.
pub fn traverse<V: AstVisitor>(root: Cursor<'_>, visitor: &mut V) {
    let unit = root.unit;
    let mut stack: Vec<(CursorId, CursorId)> = root
        .data()
        .children
        .iter()
        .rev()
        .map(|child| (*child, root.id))
        .collect();

    while let Some((id, parent)) = stack.pop() {
        let cursor = unit.cursor(id);
        if visitor.visit(cursor, unit.cursor(parent)) == ChildVisit::Recurse {
            stack.extend(cursor.data().children.iter().rev().map(|child| (*child, id)));
        }
    }
}

/// A producer of translation units
///
/// `contents_path` is read, but the unit is reported under `display_path`
/// (an editor can index an unsaved buffer written to a scratch file).
pub trait SourceParser: Send + Sync {
    fn parse(
        &self,
        contents_path: &Path,
        display_path: &Path,
        compiler_args: &CompilerArgs,
        project_root: &Path,
    ) -> Result<TranslationUnit>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a.cpp: `int foo() {}` plus a call `foo()`, and a declaration pulled in from a.h
    fn sample_unit() -> TranslationUnit {
        let mut unit = TranslationUnit::new("a.cpp");
        let header = unit.add_child(
            CursorId::ROOT,
            CursorData::new(
                AstNodeId::Function,
                "bar",
                "c:@F@bar#",
                SourceLocation::new("a.h", 1, 5),
            ),
        );
        unit.add_child(
            header,
            CursorData::new(
                AstNodeId::FunctionParameter,
                "x",
                "c:a.h@12@F@bar#@x",
                SourceLocation::new("a.h", 1, 13),
            ),
        );
        let foo = unit.add_child(
            CursorId::ROOT,
            CursorData::new(
                AstNodeId::Function,
                "foo",
                "c:@F@foo#",
                SourceLocation::new("a.cpp", 1, 5),
            ),
        );
        unit.set_definition("c:@F@foo#", foo);
        unit.add_child(
            foo,
            CursorData::new(AstNodeId::Function, "foo", "", SourceLocation::new("a.cpp", 2, 3))
                .with_referenced(foo),
        );
        unit
    }

    struct Recorder {
        seen: Vec<(String, String)>,
        skip_headers: bool,
    }

    impl AstVisitor for Recorder {
        fn visit(&mut self, cursor: Cursor<'_>, parent: Cursor<'_>) -> ChildVisit {
            self.seen.push((cursor.spelling().to_string(), parent.spelling().to_string()));
            if self.skip_headers && cursor.location().file != Path::new("a.cpp") {
                ChildVisit::Continue
            } else {
                ChildVisit::Recurse
            }
        }
    }

    #[test]
    fn test_traverse_pre_order() {
        let unit = sample_unit();
        let mut recorder = Recorder { seen: Vec::new(), skip_headers: false };
        traverse(unit.root(), &mut recorder);

        let names: Vec<&str> = recorder.seen.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["bar", "x", "foo", "foo"]);
        assert_eq!(recorder.seen[1].1, "bar");
        assert_eq!(recorder.seen[0].1, "a.cpp");
    }

    #[test]
    fn test_traverse_continue_skips_children() {
        let unit = sample_unit();
        let mut recorder = Recorder { seen: Vec::new(), skip_headers: true };
        traverse(unit.root(), &mut recorder);

        let names: Vec<&str> = recorder.seen.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["bar", "foo", "foo"]);
    }

    #[test]
    fn test_identity_follows_reference() {
        let unit = sample_unit();
        let call = unit.cursor_at(2, 4).unwrap();
        assert_eq!(call.usr(), "");
        assert_eq!(call.identity(), "c:@F@foo#");
        assert_eq!(call.referenced().unwrap().location().line, 1);
    }

    #[test]
    fn test_cursor_at_token_bounds() {
        let unit = sample_unit();
        assert_eq!(unit.cursor_at(1, 5).unwrap().spelling(), "foo");
        assert_eq!(unit.cursor_at(1, 7).unwrap().spelling(), "foo");
        assert!(unit.cursor_at(1, 8).is_none());
        assert!(unit.cursor_at(1, 4).is_none());
        // a.h cursors are not addressable through the primary file
        assert!(unit.cursor_at(1, 13).is_none());
        assert!(unit.cursor_at(40, 1).is_none());
    }

    #[test]
    fn test_definition_at() {
        let unit = sample_unit();
        let definition = unit.definition_at(2, 3).unwrap();
        assert_eq!(definition.location(), &SourceLocation::new("a.cpp", 1, 5));
        assert!(unit.definition_at(3, 1).is_none());
    }

    #[test]
    fn test_new_unit_is_empty() {
        let unit = TranslationUnit::new("empty.cpp");
        assert!(unit.is_empty());
        assert_eq!(unit.len(), 1);
        assert_eq!(unit.root().kind(), AstNodeId::TranslationUnit);
        assert_eq!(unit.root().children().count(), 0);
    }
}
