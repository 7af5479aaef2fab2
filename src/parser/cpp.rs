//! C/C++ translation units built with Tree-sitter
//!
//! Tree-sitter gives a concrete syntax tree with no semantic information, so
//! this backend layers a small resolver on top of it:
//! - quoted `#include`s (and `-I` paths) are parsed in place, their cursors
//!   hanging off the unit root with the header as their file
//! - declarations get clang-style USRs (`c:@F@foo#int`, `c:@S@Point@FI@x`,
//!   `c:a.cpp@42@F@main#@x` for locals, `c:a.cpp@8@macro@LIMIT`)
//! - identifiers are resolved through a lexical scope stack, member accesses
//!   through the declared type of the receiver when it is known
//!
//! Resolution is best-effort: no overload resolution beyond arity, no
//! templates instantiation, no return-type tracking. Unresolved names produce
//! no cursor at all.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Parser, Tree};

use super::{AstNodeId, CompilerArgs, CursorData, CursorId, SourceParser, TranslationUnit};
use crate::models::{Language, SourceLocation};

const MAX_INCLUDE_DEPTH: usize = 64;

/// Tree-sitter backed [`SourceParser`] for C and C++
#[derive(Debug, Clone, Copy, Default)]
pub struct CppParser;

impl CppParser {
    pub fn new() -> Self {
        Self
    }
}

impl SourceParser for CppParser {
    fn parse(
        &self,
        contents_path: &Path,
        display_path: &Path,
        compiler_args: &CompilerArgs,
        project_root: &Path,
    ) -> Result<TranslationUnit> {
        let source = std::fs::read(contents_path)
            .with_context(|| format!("Failed to read file: {}", contents_path.display()))?;

        let language = compiler_args
            .language
            .unwrap_or_else(|| Language::from_path(display_path));

        let tree = parse_tree(&source, language)
            .with_context(|| format!("Failed to parse file: {}", display_path.display()))?;

        let mut builder = UnitBuilder::new(
            display_path,
            language,
            compiler_args.resolved_include_dirs(project_root),
        );
        builder.walk_file(display_path, &source, &tree);

        let unit = builder.finish();
        log::debug!("Parsed {} ({} cursors)", display_path.display(), unit.len());
        Ok(unit)
    }
}

fn parse_tree(source: &[u8], language: Language) -> Result<Tree> {
    let mut parser = Parser::new();
    let grammar: tree_sitter::Language = match language {
        Language::C => tree_sitter_c::LANGUAGE.into(),
        Language::Cpp => tree_sitter_cpp::LANGUAGE.into(),
    };

    parser
        .set_language(&grammar)
        .context("Failed to set Tree-sitter language")?;

    parser
        .parse(source, None)
        .context("Tree-sitter returned no tree")
}

/// The file currently being walked (primary file or an included header)
struct SourceFile<'s> {
    path: PathBuf,
    /// Basename used in file-local USRs
    name: String,
    source: &'s [u8],
}

impl<'s> SourceFile<'s> {
    fn new(path: &Path, source: &'s [u8]) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            name,
            source,
        }
    }

    fn text(&self, node: Node<'_>) -> &'s str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn location(&self, node: Node<'_>) -> SourceLocation {
        let start = node.start_position();
        SourceLocation::new(
            self.path.clone(),
            start.row as u32 + 1,
            start.column as u32 + 1,
        )
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Global,
    Namespace,
    Class,
    Function,
    Block,
    /// Holds template parameters; declarations pass through it
    Template,
}

struct Scope {
    kind: ScopeKind,
    /// USR of the namespace or class this scope belongs to
    owner: Option<String>,
    names: HashMap<String, Vec<CursorId>>,
}

/// Where a name is looked up
enum Lookup {
    /// Innermost scope outwards
    Chain,
    /// `::name`
    Global,
    /// `Owner::name`
    Member(CursorId),
}

struct UnitBuilder {
    unit: TranslationUnit,
    language: Language,
    include_dirs: Vec<PathBuf>,
    included: HashSet<PathBuf>,
    include_depth: usize,
    scopes: Vec<Scope>,
    /// Owner USR -> member name -> declarations
    members: HashMap<String, HashMap<String, Vec<CursorId>>>,
    /// Fields and methods by bare name, for receivers of unknown type
    members_by_name: HashMap<String, Vec<CursorId>>,
    macros: HashMap<String, CursorId>,
    /// Variable/field/parameter -> USR of its class type
    var_types: HashMap<CursorId, String>,
    typedef_targets: HashMap<String, String>,
    arity: HashMap<CursorId, usize>,
    class_stack: Vec<String>,
    function_usr: Option<String>,
    pending_arity: Option<usize>,
    /// Name for an anonymous record declared by a typedef
    anon_name_hint: Option<String>,
    /// Set while a class body's members are being declared
    deferring_bodies: bool,
    /// Inline member function definitions (by start byte) waiting for their body walk
    deferred_methods: HashMap<usize, CursorId>,
}

impl UnitBuilder {
    fn new(primary: &Path, language: Language, include_dirs: Vec<PathBuf>) -> Self {
        let mut included = HashSet::new();
        included.insert(primary.canonicalize().unwrap_or_else(|_| primary.to_path_buf()));

        Self {
            unit: TranslationUnit::new(primary),
            language,
            include_dirs,
            included,
            include_depth: 0,
            scopes: vec![Scope {
                kind: ScopeKind::Global,
                owner: None,
                names: HashMap::new(),
            }],
            members: HashMap::new(),
            members_by_name: HashMap::new(),
            macros: HashMap::new(),
            var_types: HashMap::new(),
            typedef_targets: HashMap::new(),
            arity: HashMap::new(),
            class_stack: Vec::new(),
            function_usr: None,
            pending_arity: None,
            anon_name_hint: None,
            deferring_bodies: false,
            deferred_methods: HashMap::new(),
        }
    }

    fn finish(self) -> TranslationUnit {
        self.unit
    }

    fn walk_file(&mut self, path: &Path, source: &[u8], tree: &Tree) {
        let file = SourceFile::new(path, source);
        let root = tree.root_node();
        if root.has_error() {
            log::debug!("{} has syntax errors, indexing what parsed", path.display());
        }
        self.walk_children(root, &file, CursorId::ROOT);
    }

    fn walk_children(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        for child in named_children(node) {
            self.walk(child, file, parent);
        }
    }

    fn walk(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        match node.kind() {
            "preproc_include" => self.include(node, file),
            "preproc_def" | "preproc_function_def" => self.define_macro(node, file, parent),
            "preproc_call" => self.undefine_macro(node, file),
            "namespace_definition" => self.namespace(node, file, parent),
            "class_specifier" | "struct_specifier" | "union_specifier" | "enum_specifier" => {
                self.record_type(node, file, parent);
            }
            "function_definition" => self.function_definition(node, file, parent),
            "declaration" | "field_declaration" => self.declaration(node, file, parent),
            "parameter_declaration" | "optional_parameter_declaration" => {
                self.parameter(node, file, parent)
            }
            "type_definition" => self.type_definition(node, file, parent),
            "alias_declaration" => self.alias(node, file, parent),
            "template_declaration" => self.template(node, file, parent),
            "compound_statement" | "for_statement" | "if_statement" | "while_statement"
            | "do_statement" | "switch_statement" | "catch_clause" | "lambda_expression" => {
                self.push_scope(ScopeKind::Block, None);
                self.walk_children(node, file, parent);
                self.pop_scope();
            }
            "for_range_loop" => self.range_for(node, file, parent),
            "call_expression" => self.call(node, file, parent),
            "field_expression" => self.member_access(node, file, parent),
            "qualified_identifier" => {
                self.resolve_qualified(node, file, parent);
            }
            "identifier" | "type_identifier" => {
                self.resolve_name(node, file, parent);
            }
            "field_identifier" => self.implicit_member(node, file, parent),
            "comment" | "string_literal" | "raw_string_literal" | "char_literal"
            | "number_literal" | "preproc_arg" | "system_lib_string" => {}
            _ => self.walk_children(node, file, parent),
        }
    }

    // ---- preprocessor ----

    fn include(&mut self, node: Node<'_>, file: &SourceFile<'_>) {
        let Some(path_node) = node.child_by_field_name("path") else {
            return;
        };
        let raw = file.text(path_node);
        let (name, quoted) = if path_node.kind() == "system_lib_string" {
            (raw.trim_start_matches('<').trim_end_matches('>'), false)
        } else {
            (raw.trim_matches('"'), true)
        };

        let Some(resolved) = self.resolve_include(name, quoted, &file.dir()) else {
            log::trace!("Unresolved include {} in {}", raw, file.path.display());
            return;
        };

        if self.include_depth >= MAX_INCLUDE_DEPTH {
            log::warn!(
                "Include depth limit reached at {} in {}",
                raw,
                file.path.display()
            );
            return;
        }

        let key = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
        if !self.included.insert(key) {
            return;
        }

        let source = match std::fs::read(&resolved) {
            Ok(source) => source,
            Err(e) => {
                log::debug!("Failed to read include {}: {}", resolved.display(), e);
                return;
            }
        };
        let tree = match parse_tree(&source, self.language) {
            Ok(tree) => tree,
            Err(e) => {
                log::debug!("Failed to parse include {}: {}", resolved.display(), e);
                return;
            }
        };

        self.include_depth += 1;
        self.walk_file(&resolved, &source, &tree);
        self.include_depth -= 1;
    }

    fn resolve_include(&self, name: &str, quoted: bool, dir: &Path) -> Option<PathBuf> {
        if quoted {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        self.include_dirs
            .iter()
            .map(|include_dir| include_dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn define_macro(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = file.text(name_node);
        let usr = format!("c:{}@{}@macro@{}", file.name, name_node.start_byte(), name);

        let id = self.add_declaration(AstNodeId::MacroDefinition, name_node, file, parent, &usr);
        self.unit.set_definition(usr, id);
        self.macros.insert(name.to_string(), id);
    }

    fn undefine_macro(&mut self, node: Node<'_>, file: &SourceFile<'_>) {
        let directive = node.child_by_field_name("directive").map(|d| file.text(d).trim());
        if directive != Some("#undef") {
            return;
        }
        if let Some(argument) = node.child_by_field_name("argument") {
            self.macros.remove(file.text(argument).trim());
        }
    }

    // ---- declarations ----

    fn namespace(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let Some(body) = node.child_by_field_name("body") else {
            return;
        };

        // Anonymous namespace members live in the enclosing scope
        let Some(name_node) = node.child_by_field_name("name") else {
            self.walk_children(body, file, parent);
            return;
        };

        let name = file.text(name_node);
        let mut usr = format!("c:{}", self.qualifier());
        for segment in name.split("::").map(str::trim).filter(|s| !s.is_empty()) {
            usr.push_str("@N@");
            usr.push_str(segment);
        }

        let id = self.add_declaration(AstNodeId::Namespace, name_node, file, parent, &usr);
        if !name.contains("::") {
            self.declare(name, id);
        }

        self.push_scope(ScopeKind::Namespace, Some(usr));
        self.walk_children(body, file, id);
        self.pop_scope();
    }

    /// class / struct / union / enum; returns the USR of the record
    fn record_type(
        &mut self,
        node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<String> {
        let hint = self.anon_name_hint.take();
        let (kind, tag) = match node.kind() {
            "class_specifier" => (AstNodeId::Class, "S"),
            "struct_specifier" => (AstNodeId::Struct, "S"),
            "union_specifier" => (AstNodeId::Union, "U"),
            _ => (AstNodeId::Enum, "E"),
        };
        let body = node.child_by_field_name("body");

        for child in named_children(node) {
            if child.kind() == "base_class_clause" {
                self.walk(child, file, parent);
            }
        }

        let name_node = node.child_by_field_name("name").map(|name| {
            if name.kind() == "template_type" {
                name.child_by_field_name("name").unwrap_or(name)
            } else {
                name
            }
        });

        let (usr, body_parent) = match name_node {
            Some(name_node) => {
                // `struct A *p;` or `class A;` naming an already known record
                if body.is_none() {
                    if let Some(decl) = self.lookup_record(file.text(name_node)) {
                        self.add_reference(name_node, file, parent, decl);
                        return Some(self.usr_of(decl));
                    }
                }

                let name = file.text(name_node);
                let usr = format!("c:{}@{}@{}", self.qualifier(), tag, name);
                let id = self.add_declaration(kind, name_node, file, parent, &usr);
                self.declare(name, id);
                if body.is_some() {
                    self.unit.set_definition(usr.clone(), id);
                }
                (usr, id)
            }
            None => {
                let usr = match hint {
                    Some(typedef_name) => {
                        format!("c:{}@{}A@{}", self.qualifier(), tag, typedef_name)
                    }
                    None => format!(
                        "c:{}@{}a@{}@{}",
                        self.qualifier(),
                        tag,
                        file.name,
                        node.start_byte()
                    ),
                };
                (usr, parent)
            }
        };

        if let Some(body) = body {
            if kind == AstNodeId::Enum {
                self.enumerators(node, body, &usr, file, body_parent);
            } else {
                self.push_scope(ScopeKind::Class, Some(usr.clone()));
                self.class_stack.push(usr.clone());

                // Inline bodies see every member, including ones declared after them
                let deferring = std::mem::replace(&mut self.deferring_bodies, true);
                self.walk_children(body, file, body_parent);
                self.deferring_bodies = false;
                self.walk_member_bodies(body, file, body_parent);
                self.deferring_bodies = deferring;

                self.class_stack.pop();
                self.pop_scope();
            }
        }

        Some(usr)
    }

    fn enumerators(
        &mut self,
        specifier: Node<'_>,
        body: Node<'_>,
        enum_usr: &str,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) {
        let mut cursor = specifier.walk();
        let scoped = specifier
            .children(&mut cursor)
            .any(|child| matches!(child.kind(), "class" | "struct"));

        for enumerator in named_children(body) {
            if enumerator.kind() != "enumerator" {
                continue;
            }
            let Some(name_node) = enumerator.child_by_field_name("name") else {
                continue;
            };
            let name = file.text(name_node);
            let usr = format!("{}@{}", enum_usr, name);

            let id = self.add_declaration(AstNodeId::EnumValue, name_node, file, parent, &usr);
            self.unit.set_definition(usr, id);
            self.declare_member(enum_usr, name, id);
            if !scoped {
                self.declare(name, id);
            }

            if let Some(value) = enumerator.child_by_field_name("value") {
                self.walk(value, file, parent);
            }
        }
    }

    fn function_definition(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        if let Some(ty) = node.child_by_field_name("type") {
            self.walk_type(ty, file, parent);
        }

        let core = node
            .child_by_field_name("declarator")
            .map(|declarator| unwrap_declarator(declarator).0);

        match core {
            Some(core) if core.kind() == "function_declarator" => {
                let body = node.child_by_field_name("body");
                self.function(core, Some(node), body, file, parent);
            }
            _ => {
                if let Some(body) = node.child_by_field_name("body") {
                    self.walk(body, file, parent);
                }
            }
        }
    }

    /// Declare the function named by `declarator` and walk its parameters and body
    fn function(
        &mut self,
        declarator: Node<'_>,
        definition: Option<Node<'_>>,
        body: Option<Node<'_>>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<CursorId> {
        let name_node = declarator.child_by_field_name("declarator")?;
        let parameters = declarator.child_by_field_name("parameters");

        // `A::f` / `ns::f`: the scope part is a use of A / ns
        let (owner, name_node) = if name_node.kind() == "qualified_identifier" {
            match self.resolve_scope(name_node, file, parent) {
                Some((Lookup::Member(owner), last)) => (Some(owner), last),
                Some((_, last)) => (None, last),
                None => (None, last_name_segment(name_node)),
            }
        } else {
            (None, name_node)
        };
        let name_node = match name_node.kind() {
            "template_function" => name_node.child_by_field_name("name").unwrap_or(name_node),
            _ => name_node,
        };
        let name = file.text(name_node);

        let (kind, owner_usr) = match owner {
            Some(owner) => {
                let owner_cursor = self.unit.cursor(owner);
                let kind = if is_record(owner_cursor.kind()) {
                    AstNodeId::Method
                } else {
                    AstNodeId::Function
                };
                (kind, Some(owner_cursor.usr().to_string()))
            }
            None if self.in_class_scope() => (AstNodeId::Method, None),
            None => (AstNodeId::Function, None),
        };

        let prefix = match &owner_usr {
            Some(usr) => usr.trim_start_matches("c:").to_string(),
            None => self.qualifier(),
        };
        let parameter_types = parameters
            .map(|params| parameter_types(params, file))
            .unwrap_or_default();
        let usr = format!("c:{}@F@{}#{}", prefix, name, parameter_types.join(","));

        let id = self.add_declaration(kind, name_node, file, parent, &usr);
        self.arity.insert(id, parameter_types.len());
        match &owner_usr {
            Some(owner_usr) => self.declare_member(owner_usr, name, id),
            None => self.declare(name, id),
        }
        if kind == AstNodeId::Method {
            self.members_by_name.entry(name.to_string()).or_default().push(id);
        }
        if body.is_some() {
            self.unit.set_definition(usr.clone(), id);
        }

        let directly_in_class =
            matches!(self.scopes.last().map(|s| s.kind), Some(ScopeKind::Class));
        if let Some(definition) = definition {
            if self.deferring_bodies && owner_usr.is_none() && directly_in_class {
                self.deferred_methods.insert(definition.start_byte(), id);
                return Some(id);
            }
        }

        let owner_scope = owner_usr.map(|owner_usr| {
            let scope_kind = if kind == AstNodeId::Method {
                self.class_stack.push(owner_usr.clone());
                ScopeKind::Class
            } else {
                ScopeKind::Namespace
            };
            self.push_scope(scope_kind, Some(owner_usr));
            scope_kind
        });
        self.walk_function_body(id, usr, parameters, definition, body, file);

        if let Some(scope_kind) = owner_scope {
            self.pop_scope();
            if scope_kind == ScopeKind::Class {
                self.class_stack.pop();
            }
        }

        Some(id)
    }

    /// Walk parameters, constructor initializers and body of function `id`
    fn walk_function_body(
        &mut self,
        id: CursorId,
        usr: String,
        parameters: Option<Node<'_>>,
        definition: Option<Node<'_>>,
        body: Option<Node<'_>>,
        file: &SourceFile<'_>,
    ) {
        let enclosing_function = self.function_usr.replace(usr);
        self.push_scope(ScopeKind::Function, None);

        if let Some(parameters) = parameters {
            self.walk_children(parameters, file, id);
        }
        if let Some(definition) = definition {
            for child in named_children(definition) {
                if child.kind() == "field_initializer_list" {
                    self.walk_children(child, file, id);
                }
            }
        }
        if let Some(body) = body {
            self.walk(body, file, id);
        }

        self.pop_scope();
        self.function_usr = enclosing_function;
    }

    /// Second pass over a class body: inline method bodies and member initializers
    fn walk_member_bodies(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        for child in named_children(node) {
            match child.kind() {
                "function_definition" => {
                    let Some(id) = self.deferred_methods.remove(&child.start_byte()) else {
                        continue;
                    };
                    let parameters = child
                        .child_by_field_name("declarator")
                        .map(|declarator| unwrap_declarator(declarator).0)
                        .and_then(|core| core.child_by_field_name("parameters"));
                    let usr = self.usr_of(id);
                    let body = child.child_by_field_name("body");
                    self.walk_function_body(id, usr, parameters, Some(child), body, file);
                }
                "field_declaration" => self.field_initializers(child, file, parent),
                // nested records and member templates finish their own walk
                "class_specifier" | "struct_specifier" | "union_specifier" | "enum_specifier"
                | "template_declaration" => {}
                _ => self.walk_member_bodies(child, file, parent),
            }
        }
    }

    fn field_initializers(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let mut cursor = node.walk();
        let declarators: Vec<Node<'_>> = node
            .children_by_field_name("declarator", &mut cursor)
            .collect();
        for declarator in declarators {
            if declarator.kind() == "init_declarator" {
                if let Some(value) = declarator.child_by_field_name("value") {
                    self.walk(value, file, parent);
                }
            }
        }
        if let Some(default_value) = node.child_by_field_name("default_value") {
            self.walk(default_value, file, parent);
        }
    }

    fn declaration(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let is_field = node.kind() == "field_declaration";
        let defer_values = is_field && self.deferring_bodies;
        let type_usr = node
            .child_by_field_name("type")
            .and_then(|ty| self.walk_type(ty, file, parent));
        let is_extern = named_children(node).into_iter().any(|child| {
            child.kind() == "storage_class_specifier" && file.text(child) == "extern"
        });

        let mut cursor = node.walk();
        let declarators: Vec<Node<'_>> = node
            .children_by_field_name("declarator", &mut cursor)
            .collect();

        for declarator in declarators {
            let (core, _) = unwrap_declarator(declarator);
            if core.kind() == "function_declarator" && !is_function_pointer(core) {
                self.function(core, None, None, file, parent);
                continue;
            }

            let Some(name_node) = declarator_name(declarator) else {
                self.walk(declarator, file, parent);
                continue;
            };

            let kind = if is_field {
                AstNodeId::Field
            } else {
                AstNodeId::LocalVariable
            };
            self.declare_variable(kind, name_node, file, parent, type_usr.as_deref(), !is_extern);

            if declarator.kind() == "init_declarator" && !defer_values {
                if let Some(value) = declarator.child_by_field_name("value") {
                    self.walk(value, file, parent);
                }
            }
        }

        if defer_values {
            return;
        }
        if let Some(default_value) = node.child_by_field_name("default_value") {
            self.walk(default_value, file, parent);
        }
    }

    fn parameter(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let type_usr = node
            .child_by_field_name("type")
            .and_then(|ty| self.walk_type(ty, file, parent));

        if let Some(name_node) = node
            .child_by_field_name("declarator")
            .and_then(declarator_name)
        {
            self.declare_variable(
                AstNodeId::FunctionParameter,
                name_node,
                file,
                parent,
                type_usr.as_deref(),
                true,
            );
        }

        if let Some(default_value) = node.child_by_field_name("default_value") {
            self.walk(default_value, file, parent);
        }
    }

    fn declare_variable(
        &mut self,
        kind: AstNodeId,
        name_node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
        type_usr: Option<&str>,
        is_definition: bool,
    ) -> CursorId {
        let name = file.text(name_node);
        let usr = match kind {
            AstNodeId::Field => format!("c:{}@FI@{}", self.qualifier(), name),
            AstNodeId::FunctionParameter => self.local_usr(name_node, file),
            _ if self.in_local_scope() => self.local_usr(name_node, file),
            _ => format!("c:{}@{}", self.qualifier(), name),
        };

        let id = self.add_declaration(kind, name_node, file, parent, &usr);
        if is_definition {
            self.unit.set_definition(usr, id);
        }
        self.declare(name, id);
        if kind == AstNodeId::Field {
            self.members_by_name.entry(name.to_string()).or_default().push(id);
        }
        if let Some(ty) = type_usr {
            self.var_types.insert(id, ty.to_string());
        }
        id
    }

    fn type_definition(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let mut cursor = node.walk();
        let declarators: Vec<Node<'_>> = node
            .children_by_field_name("declarator", &mut cursor)
            .collect();

        let target = node.child_by_field_name("type").and_then(|ty| {
            self.anon_name_hint = declarators
                .first()
                .and_then(|d| declarator_name(*d))
                .map(|n| file.text(n).to_string());
            let target = self.walk_type(ty, file, parent);
            self.anon_name_hint = None;
            target
        });

        for declarator in declarators {
            let Some(name_node) = declarator_name(declarator) else {
                continue;
            };
            self.declare_typedef(name_node, file, parent, target.as_deref());
        }
    }

    fn alias(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let target = node
            .child_by_field_name("type")
            .and_then(|ty| self.walk_type(ty, file, parent));
        if let Some(name_node) = node.child_by_field_name("name") {
            self.declare_typedef(name_node, file, parent, target.as_deref());
        }
    }

    fn declare_typedef(
        &mut self,
        name_node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
        target: Option<&str>,
    ) {
        let name = file.text(name_node);
        let usr = format!("c:{}@T@{}", self.qualifier(), name);
        let id = self.add_declaration(AstNodeId::Typedef, name_node, file, parent, &usr);
        self.declare(name, id);
        if let Some(target) = target {
            self.typedef_targets.insert(usr.clone(), target.to_string());
        }
        self.unit.set_definition(usr, id);
    }

    fn template(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        self.push_scope(ScopeKind::Template, None);

        if let Some(parameters) = node.child_by_field_name("parameters") {
            for parameter in named_children(parameters) {
                let name_node = match parameter.kind() {
                    "type_parameter_declaration" | "variadic_type_parameter_declaration" => {
                        named_children(parameter)
                            .into_iter()
                            .find(|child| child.kind() == "type_identifier")
                    }
                    "optional_type_parameter_declaration" => parameter.child_by_field_name("name"),
                    "parameter_declaration"
                    | "optional_parameter_declaration"
                    | "variadic_parameter_declaration" => parameter
                        .child_by_field_name("declarator")
                        .and_then(declarator_name),
                    _ => None,
                };
                let Some(name_node) = name_node else {
                    continue;
                };
                let name = file.text(name_node);
                let usr = format!("c:{}@{}@T@{}", file.name, name_node.start_byte(), name);
                let id = self.add_declaration(AstNodeId::Unexposed, name_node, file, parent, &usr);
                if let Some(scope) = self.scopes.last_mut() {
                    scope.names.entry(name.to_string()).or_default().push(id);
                }
            }
        }

        for child in named_children(node) {
            if child.kind() != "template_parameter_list" {
                self.walk(child, file, parent);
            }
        }

        self.pop_scope();
    }

    fn range_for(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        self.push_scope(ScopeKind::Block, None);

        let type_usr = node
            .child_by_field_name("type")
            .and_then(|ty| self.walk_type(ty, file, parent));
        if let Some(right) = node.child_by_field_name("right") {
            self.walk(right, file, parent);
        }
        if let Some(declarator) = node.child_by_field_name("declarator") {
            match declarator_name(declarator) {
                Some(name_node) => {
                    self.declare_variable(
                        AstNodeId::LocalVariable,
                        name_node,
                        file,
                        parent,
                        type_usr.as_deref(),
                        true,
                    );
                }
                None => self.walk(declarator, file, parent),
            }
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.walk(body, file, parent);
        }

        self.pop_scope();
    }

    /// Walk a type position; returns the record USR the type names, if any
    fn walk_type(
        &mut self,
        ty: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<String> {
        match ty.kind() {
            "class_specifier" | "struct_specifier" | "union_specifier" | "enum_specifier" => {
                self.record_type(ty, file, parent)
            }
            _ => {
                self.walk(ty, file, parent);
                self.type_usr(ty, file)
            }
        }
    }

    // ---- uses ----

    fn call(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let arguments = node.child_by_field_name("arguments");
        if let Some(function) = node.child_by_field_name("function") {
            self.pending_arity = arguments.map(count_arguments);
            self.walk(function, file, parent);
            self.pending_arity = None;
        }
        if let Some(arguments) = arguments {
            self.walk(arguments, file, parent);
        }
    }

    fn member_access(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let arity = self.pending_arity.take();
        let argument = node.child_by_field_name("argument");
        if let Some(argument) = argument {
            self.walk(argument, file, parent);
        }
        let receiver = argument.and_then(|argument| self.expression_type(argument, file));

        let Some(field) = node.child_by_field_name("field") else {
            return;
        };
        let field = match field.kind() {
            "template_method" => {
                if let Some(arguments) = field.child_by_field_name("arguments") {
                    self.walk(arguments, file, parent);
                }
                match field.child_by_field_name("name") {
                    Some(name) => name,
                    None => return,
                }
            }
            "field_identifier" => field,
            _ => return,
        };

        self.pending_arity = arity;
        self.resolve_member(field, receiver, file, parent);
        self.pending_arity = None;
    }

    /// `field_identifier` outside a member access: initializer lists, designators
    fn implicit_member(&mut self, node: Node<'_>, file: &SourceFile<'_>, parent: CursorId) {
        let name = file.text(node);
        let in_scope = self.lookup(&Lookup::Chain, name).filter(|candidates| {
            candidates.iter().any(|id| {
                matches!(
                    self.unit.cursor(*id).kind(),
                    AstNodeId::Field | AstNodeId::Method
                )
            })
        });

        match in_scope {
            Some(candidates) => {
                if let Some(decl) = self.pick(candidates) {
                    self.add_reference(node, file, parent, decl);
                }
            }
            None => {
                self.resolve_member(node, None, file, parent);
            }
        }
    }

    fn resolve_member(
        &mut self,
        node: Node<'_>,
        receiver: Option<String>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<CursorId> {
        let name = file.text(node);
        let candidates = match receiver.and_then(|owner| self.lookup_member(&owner, name)) {
            Some(candidates) => candidates,
            None => self.members_by_name.get(name).cloned()?,
        };
        let decl = self.pick(candidates)?;
        self.add_reference(node, file, parent, decl);
        Some(decl)
    }

    fn resolve_name(
        &mut self,
        node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<CursorId> {
        let name = file.text(node);
        let decl = match self.macros.get(name) {
            Some(id) => *id,
            None => {
                let candidates = self.lookup(&Lookup::Chain, name)?;
                self.pick(candidates)?
            }
        };
        self.add_reference(node, file, parent, decl);
        Some(decl)
    }

    fn resolve_qualified(
        &mut self,
        node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<CursorId> {
        let (lookup, name_node) = self.resolve_scope(node, file, parent)?;
        let name_node = match name_node.kind() {
            "template_function" | "template_type" => {
                if let Some(arguments) = name_node.child_by_field_name("arguments") {
                    self.walk(arguments, file, parent);
                }
                name_node.child_by_field_name("name")?
            }
            _ => name_node,
        };

        let candidates = self.lookup(&lookup, file.text(name_node))?;
        let decl = self.pick(candidates)?;
        self.add_reference(name_node, file, parent, decl);
        Some(decl)
    }

    /// Resolve the scope chain of `a::b::name`, recording uses of `a` and `b`
    ///
    /// Returns where `name` has to be looked up, and the `name` node itself.
    fn resolve_scope<'t>(
        &mut self,
        node: Node<'t>,
        file: &SourceFile<'_>,
        parent: CursorId,
    ) -> Option<(Lookup, Node<'t>)> {
        let mut lookup = Lookup::Chain;
        let mut current = node;

        loop {
            match current.child_by_field_name("scope") {
                Some(scope) => {
                    let scope_name = match scope.kind() {
                        "template_type" => scope.child_by_field_name("name")?,
                        _ => scope,
                    };
                    let decl = *self.lookup(&lookup, file.text(scope_name))?.first()?;
                    self.add_reference(scope_name, file, parent, decl);
                    lookup = Lookup::Member(decl);
                }
                None => lookup = Lookup::Global,
            }

            let name = current.child_by_field_name("name")?;
            if name.kind() == "qualified_identifier" {
                current = name;
                continue;
            }
            return Some((lookup, name));
        }
    }

    /// Class USR of an expression's value, when it can be told from declarations
    fn expression_type(&self, node: Node<'_>, file: &SourceFile<'_>) -> Option<String> {
        match node.kind() {
            "this" => self.class_stack.last().cloned(),
            "identifier" => {
                let decl = *self.lookup(&Lookup::Chain, file.text(node))?.first()?;
                self.var_types.get(&decl).cloned()
            }
            "field_expression" => {
                let owner = self.expression_type(node.child_by_field_name("argument")?, file)?;
                let field = node.child_by_field_name("field")?;
                let decl = *self.lookup_member(&owner, file.text(field))?.first()?;
                self.var_types.get(&decl).cloned()
            }
            "parenthesized_expression" => self.expression_type(node.named_child(0)?, file),
            "pointer_expression" | "subscript_expression" => {
                self.expression_type(node.child_by_field_name("argument")?, file)
            }
            _ => None,
        }
    }

    /// Record USR named by a type node, following typedefs
    fn type_usr(&self, ty: Node<'_>, file: &SourceFile<'_>) -> Option<String> {
        match ty.kind() {
            "type_identifier" => {
                let candidates = self.lookup(&Lookup::Chain, file.text(ty))?;
                candidates.iter().find_map(|decl| self.record_usr(*decl))
            }
            "template_type" => self.type_usr(ty.child_by_field_name("name")?, file),
            _ => None,
        }
    }

    fn record_usr(&self, decl: CursorId) -> Option<String> {
        let cursor = self.unit.cursor(decl);
        match cursor.kind() {
            AstNodeId::Class | AstNodeId::Struct | AstNodeId::Union => {
                Some(cursor.usr().to_string())
            }
            AstNodeId::Typedef => self.typedef_targets.get(cursor.usr()).cloned(),
            _ => None,
        }
    }

    fn lookup_record(&self, name: &str) -> Option<CursorId> {
        self.lookup(&Lookup::Chain, name)?.into_iter().find(|decl| {
            matches!(
                self.unit.cursor(*decl).kind(),
                AstNodeId::Class | AstNodeId::Struct | AstNodeId::Union | AstNodeId::Enum
            )
        })
    }

    // ---- scopes ----

    fn push_scope(&mut self, kind: ScopeKind, owner: Option<String>) {
        let names = owner
            .as_ref()
            .and_then(|owner| self.members.get(owner))
            .cloned()
            .unwrap_or_default();
        self.scopes.push(Scope { kind, owner, names });
    }

    fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Innermost scope that takes declarations
    fn declaring_scope(&self) -> Option<&Scope> {
        self.scopes
            .iter()
            .rev()
            .find(|scope| scope.kind != ScopeKind::Template)
    }

    fn in_class_scope(&self) -> bool {
        matches!(self.declaring_scope().map(|s| s.kind), Some(ScopeKind::Class))
    }

    fn in_local_scope(&self) -> bool {
        matches!(
            self.declaring_scope().map(|s| s.kind),
            Some(ScopeKind::Function | ScopeKind::Block)
        )
    }

    /// USR prefix of the innermost namespace or class (without `c:`)
    fn qualifier(&self) -> String {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.owner.as_deref())
            .map(|owner| owner.trim_start_matches("c:").to_string())
            .unwrap_or_default()
    }

    fn local_usr(&self, name_node: Node<'_>, file: &SourceFile<'_>) -> String {
        let function = self
            .function_usr
            .as_deref()
            .map(|usr| usr.trim_start_matches("c:"))
            .unwrap_or("");
        format!(
            "c:{}@{}{}@{}",
            file.name,
            name_node.start_byte(),
            function,
            file.text(name_node)
        )
    }

    fn declare(&mut self, name: &str, id: CursorId) {
        let Some(scope) = self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.kind != ScopeKind::Template)
        else {
            return;
        };
        scope.names.entry(name.to_string()).or_default().push(id);
        if let Some(owner) = scope.owner.clone() {
            self.members
                .entry(owner)
                .or_default()
                .entry(name.to_string())
                .or_default()
                .push(id);
        }
    }

    fn declare_member(&mut self, owner: &str, name: &str, id: CursorId) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.owner.as_deref() == Some(owner) {
                scope.names.entry(name.to_string()).or_default().push(id);
                break;
            }
        }
        self.members
            .entry(owner.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(id);
    }

    fn lookup(&self, lookup: &Lookup, name: &str) -> Option<Vec<CursorId>> {
        match lookup {
            Lookup::Chain => self
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.names.get(name))
                .cloned(),
            Lookup::Global => self.scopes.first()?.names.get(name).cloned(),
            Lookup::Member(owner) => self.lookup_member(self.unit.cursor(*owner).usr(), name),
        }
    }

    fn lookup_member(&self, owner: &str, name: &str) -> Option<Vec<CursorId>> {
        self.members.get(owner)?.get(name).cloned()
    }

    /// Choose among same-named declarations, preferring a matching call arity
    fn pick(&mut self, candidates: Vec<CursorId>) -> Option<CursorId> {
        if let Some(arity) = self.pending_arity.take() {
            if let Some(found) = candidates
                .iter()
                .find(|id| self.arity.get(*id) == Some(&arity))
            {
                return Some(*found);
            }
        }
        candidates.first().copied()
    }

    // ---- cursors ----

    fn usr_of(&self, id: CursorId) -> String {
        self.unit.cursor(id).usr().to_string()
    }

    fn add_declaration(
        &mut self,
        kind: AstNodeId,
        name_node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
        usr: &str,
    ) -> CursorId {
        let data = CursorData::new(kind, file.text(name_node), usr, file.location(name_node));
        self.unit.add_child(parent, data)
    }

    fn add_reference(
        &mut self,
        name_node: Node<'_>,
        file: &SourceFile<'_>,
        parent: CursorId,
        decl: CursorId,
    ) -> Option<CursorId> {
        let kind = match self.unit.cursor(decl).kind() {
            AstNodeId::MacroDefinition => AstNodeId::MacroInstantiation,
            AstNodeId::Namespace | AstNodeId::Unexposed | AstNodeId::TranslationUnit => return None,
            kind => kind,
        };
        let data = CursorData::new(kind, file.text(name_node), "", file.location(name_node))
            .with_referenced(decl);
        Some(self.unit.add_child(parent, data))
    }
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    let children = node.named_children(&mut cursor).collect();
    children
}

fn is_record(kind: AstNodeId) -> bool {
    matches!(kind, AstNodeId::Class | AstNodeId::Struct | AstNodeId::Union)
}

/// Peel pointer/reference/array/init wrappers down to the core declarator
///
/// Stops at a `function_declarator`. The returned string holds the type
/// decorations that were peeled (`*`, `&`, `[]`).
fn unwrap_declarator(node: Node<'_>) -> (Node<'_>, String) {
    let mut markers = String::new();
    let mut current = node;

    loop {
        let next = match current.kind() {
            "pointer_declarator" | "abstract_pointer_declarator" => {
                markers.push('*');
                current.child_by_field_name("declarator")
            }
            "reference_declarator" | "abstract_reference_declarator" => {
                markers.push('&');
                current.named_child(0)
            }
            "array_declarator" | "abstract_array_declarator" => {
                markers.push_str("[]");
                current.child_by_field_name("declarator")
            }
            "init_declarator" => current.child_by_field_name("declarator"),
            "parenthesized_declarator" | "attributed_declarator" => current.named_child(0),
            _ => None,
        };

        match next {
            Some(next) => current = next,
            None => return (current, markers),
        }
    }
}

/// `int (*fp)(int)` declares a variable, not a function
fn is_function_pointer(function_declarator: Node<'_>) -> bool {
    function_declarator
        .child_by_field_name("declarator")
        .is_some_and(|inner| inner.kind() == "parenthesized_declarator")
}

/// The identifier a declarator declares, if any
fn declarator_name(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "identifier" | "field_identifier" | "type_identifier" | "destructor_name"
        | "operator_name" => Some(node),
        "qualified_identifier" => Some(last_name_segment(node)),
        "template_function" => node.child_by_field_name("name"),
        "pointer_declarator" | "array_declarator" | "init_declarator" | "function_declarator" => {
            declarator_name(node.child_by_field_name("declarator")?)
        }
        "reference_declarator" | "parenthesized_declarator" | "attributed_declarator" => {
            declarator_name(node.named_child(0)?)
        }
        _ => None,
    }
}

fn last_name_segment(node: Node<'_>) -> Node<'_> {
    let mut current = node;
    while current.kind() == "qualified_identifier" {
        match current.child_by_field_name("name") {
            Some(name) => current = name,
            None => break,
        }
    }
    current
}

/// Normalized parameter types of a parameter list, used in function USRs
fn parameter_types(parameters: Node<'_>, file: &SourceFile<'_>) -> Vec<String> {
    let mut types = Vec::new();

    for parameter in named_children(parameters) {
        match parameter.kind() {
            "parameter_declaration" | "optional_parameter_declaration" => {
                let base: String = parameter
                    .child_by_field_name("type")
                    .map(|ty| file.text(ty))
                    .unwrap_or("")
                    .split_whitespace()
                    .collect();
                let markers = parameter
                    .child_by_field_name("declarator")
                    .map(|declarator| unwrap_declarator(declarator).1)
                    .unwrap_or_default();
                types.push(format!("{}{}", base, markers));
            }
            "variadic_parameter" | "variadic_parameter_declaration" => {
                types.push("...".to_string())
            }
            _ => {}
        }
    }

    // `f(void)` takes no arguments
    if types.len() == 1 && types[0] == "void" {
        types.clear();
    }
    types
}

fn count_arguments(arguments: Node<'_>) -> usize {
    named_children(arguments)
        .into_iter()
        .filter(|child| child.kind() != "comment")
        .count()
}
