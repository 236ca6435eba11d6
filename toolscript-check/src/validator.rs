//! Structural type validation of guest code
//!
//! Guest code is wrapped in the same function-body scaffold the runtime uses
//! and walked against the typed [`Declarations`] model. The walk tracks
//! block-scoped bindings and narrows discriminated tool results through
//! conditions, so the usual
//!
//! ```js
//! const r = mux.file_read({ path: "a.txt" });
//! if (!r.success) return r.error;
//! return r.content;
//! ```
//!
//! checks cleanly while `r.contents` or `mux.file_read({ file: "a.txt" })`
//! do not.
//!
//! Diagnostics use TypeScript's wording. Positions are 1-indexed in the
//! caller's code; anything located in the scaffold is dropped.

use crate::error::{line_count, Result, SourcePosition};
use crate::globals::is_es_global;
use crate::signatures::{Declarations, ToolSignature};
use crate::syntax::{node_text, ScriptParser};
use crate::types::{Field, Literal, ObjectType, Property, Refinement, TsType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tree_sitter::{Node, Point};

const SCAFFOLD_HEADER: &str = "function __agent__() {\n";
const SCAFFOLD_FOOTER: &str = "\n}";

/// Members every object inherits from `Object.prototype`
const OBJECT_PROTOTYPE_MEMBERS: &[&str] = &[
    "constructor",
    "hasOwnProperty",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toLocaleString",
    "toString",
    "valueOf",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

/// Checks guest code against generated tool declarations
pub struct TypeValidator {
    parser: ScriptParser,
}

impl TypeValidator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            parser: ScriptParser::new()?,
        })
    }

    pub fn validate(&self, code: &str, declarations: &Declarations) -> Result<ValidationResult> {
        let scaffold = format!("{}{}{}", SCAFFOLD_HEADER, code, SCAFFOLD_FOOTER);
        let tree = self.parser.parse(&scaffold)?;

        let mut checker = Checker::new(&scaffold, declarations);
        let root = tree.root_node();
        if root.has_error() {
            checker.collect_syntax_errors(root);
        } else if let Some(body) = agent_body(root) {
            checker.check_function_body(body, None);
        }

        let code_lines = line_count(code);
        let mut errors: Vec<ValidationError> = Vec::new();
        for diagnostic in checker.diagnostics {
            let position = SourcePosition::from_point(&scaffold, diagnostic.point);
            // Scaffold line 1 is the header.
            let line = position.line - 1;
            let (line, column) = if line >= 1 && line <= code_lines {
                (line, Some(position.column))
            } else if diagnostic.syntax {
                // An unterminated construct is detected at the scaffold's
                // closing brace; blame the caller's code around it.
                (line.clamp(1, code_lines), None)
            } else {
                continue;
            };
            let error = ValidationError {
                message: diagnostic.message,
                line: Some(line),
                column,
            };
            if !errors.contains(&error) {
                errors.push(error);
            }
        }
        errors.sort_by_key(|e| (e.line, e.column));

        tracing::debug!(errors = errors.len(), "type validation finished");
        Ok(ValidationResult {
            valid: errors.is_empty(),
            errors,
        })
    }
}

/// Validate `code` against `declarations` with a one-off validator
pub fn validate_types(code: &str, declarations: &Declarations) -> Result<ValidationResult> {
    TypeValidator::new()?.validate(code, declarations)
}

fn agent_body(root: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = root.walk();
    let function = root
        .named_children(&mut cursor)
        .find(|n| n.kind() == "function_declaration")?;
    function.child_by_field_name("body")
}

// ============================================================================
// Checker
// ============================================================================

struct Diagnostic {
    message: String,
    point: Point,
    syntax: bool,
}

#[derive(Debug, Clone)]
struct Binding {
    declared: TsType,
    current: TsType,
    constant: bool,
}

impl Binding {
    fn new(ty: TsType, constant: bool) -> Self {
        Self {
            declared: ty.clone(),
            current: ty,
            constant,
        }
    }
}

/// What a condition establishes about `var.field`
#[derive(Debug, Clone)]
struct Fact {
    var: String,
    field: String,
    refinement: Refinement,
}

struct Checker<'a> {
    source: &'a str,
    declarations: &'a Declarations,
    scopes: Vec<HashMap<String, Binding>>,
    diagnostics: Vec<Diagnostic>,
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node
        .named_children(&mut cursor)
        .filter(|n| n.kind() != "comment")
        .collect();
    children
}

/// `const` declarations bind read-only names
fn is_const(declaration: Node<'_>) -> bool {
    declaration.child(0).is_some_and(|kind| kind.kind() == "const")
}

impl<'a> Checker<'a> {
    fn new(source: &'a str, declarations: &'a Declarations) -> Self {
        Self {
            source,
            declarations,
            scopes: vec![HashMap::new()],
            diagnostics: Vec::new(),
        }
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        node_text(node, self.source)
    }

    fn report(&mut self, node: Node<'_>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            point: node.start_position(),
            syntax: false,
        });
    }

    fn report_syntax(&mut self, node: Node<'_>, message: String) {
        self.diagnostics.push(Diagnostic {
            message,
            point: node.start_position(),
            syntax: true,
        });
    }


    fn collect_syntax_errors(&mut self, node: Node<'_>) {
        if node.is_missing() {
            let message = format!("Syntax error: missing '{}'", node.kind());
            self.report_syntax(node, message);
            return;
        }
        if node.is_error() {
            let text: String = self.text(node).trim().chars().take(24).collect();
            let message = if text.is_empty() {
                "Syntax error: unexpected end of input".to_string()
            } else {
                format!("Syntax error: unexpected '{}'", text)
            };
            self.report_syntax(node, message);
            return;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            if child.has_error() || child.is_missing() {
                self.collect_syntax_errors(child);
            }
        }
    }


    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, ty: TsType, constant: bool) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), Binding::new(ty, constant));
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes.iter_mut().rev().find_map(|scope| scope.get_mut(name))
    }

    fn apply_facts(&mut self, facts: &[Fact]) {
        for fact in facts {
            let Some(binding) = self.lookup(&fact.var) else {
                continue;
            };
            let narrowed = binding.current.narrow(&fact.field, &fact.refinement);
            if narrowed != binding.current {
                let binding = Binding {
                    declared: binding.declared.clone(),
                    current: narrowed,
                    constant: binding.constant,
                };
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(fact.var.clone(), binding);
                }
            }
        }
    }

    fn with_facts<R>(&mut self, facts: &[Fact], f: impl FnOnce(&mut Self) -> R) -> R {
        self.push_scope();
        self.apply_facts(facts);
        let result = f(self);
        self.pop_scope();
        result
    }

    /// Declare hoisted names of a block before walking it
    fn hoist(&mut self, statements: &[Node<'_>]) {
        for statement in statements {
            match statement.kind() {
                "lexical_declaration" => {
                    let constant = is_const(*statement);
                    for declarator in named_children(*statement) {
                        if let Some(name) = declarator.child_by_field_name("name") {
                            let mut names = Vec::new();
                            pattern_names(name, self.source, &mut names);
                            for n in names {
                                self.declare(n, TsType::Any, constant);
                            }
                        }
                    }
                }
                "function_declaration" | "generator_function_declaration" | "class_declaration" => {
                    if let Some(name) = statement.child_by_field_name("name") {
                        self.declare(self.text(name), TsType::Any, false);
                    }
                }
                _ => {}
            }
        }
    }


    fn check_function_body(&mut self, body: Node<'_>, params: Option<Node<'_>>) {
        self.push_scope();
        let mut vars = Vec::new();
        collect_var_names(body, self.source, &mut vars);
        for name in vars {
            self.declare(name, TsType::Any, false);
        }
        if let Some(params) = params {
            self.bind_parameters(params);
        }
        if body.kind() == "statement_block" {
            self.check_statements(&named_children(body));
        } else {
            self.eval(body);
        }
        self.pop_scope();
    }

    fn bind_parameters(&mut self, params: Node<'_>) {
        if params.kind() == "identifier" {
            self.declare(self.text(params), TsType::Any, false);
            return;
        }
        for param in named_children(params) {
            match param.kind() {
                "required_parameter" | "optional_parameter" => {
                    if let Some(default) = param.child_by_field_name("value") {
                        self.eval(default);
                    }
                    if let Some(pattern) = param.child_by_field_name("pattern") {
                        self.bind_pattern(pattern, &TsType::Any, false);
                    }
                }
                _ => self.bind_pattern(param, &TsType::Any, false),
            }
        }
    }

    fn check_function(&mut self, node: Node<'_>) -> TsType {
        let params = node
            .child_by_field_name("parameters")
            .or_else(|| node.child_by_field_name("parameter"));
        if let Some(body) = node.child_by_field_name("body") {
            self.check_function_body(body, params);
        }
        TsType::Any
    }

    fn check_class(&mut self, node: Node<'_>) {
        if let Some(heritage) = named_children(node)
            .into_iter()
            .find(|n| n.kind() == "class_heritage")
        {
            for child in named_children(heritage) {
                self.eval(child);
            }
        }
        let Some(body) = node.child_by_field_name("body") else {
            return;
        };
        for member in named_children(body) {
            match member.kind() {
                "method_definition" => {
                    self.check_function(member);
                }
                "public_field_definition" | "field_definition" => {
                    if let Some(value) = member.child_by_field_name("value") {
                        self.eval(value);
                    }
                }
                _ => {}
            }
        }
    }


    fn check_statements(&mut self, statements: &[Node<'_>]) {
        self.hoist(statements);
        for statement in statements {
            self.check_statement(*statement);
        }
    }

    fn check_block(&mut self, node: Node<'_>) {
        if node.kind() == "statement_block" {
            self.push_scope();
            self.check_statements(&named_children(node));
            self.pop_scope();
        } else {
            self.check_statement(node);
        }
    }

    fn check_statement(&mut self, node: Node<'_>) {
        match node.kind() {
            "expression_statement" => {
                for child in named_children(node) {
                    self.eval(child);
                }
            }
            "lexical_declaration" | "variable_declaration" => self.check_declaration(node),
            "function_declaration" | "generator_function_declaration" => {
                self.check_function(node);
            }
            "class_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.declare(self.text(name), TsType::Any, false);
                }
                self.check_class(node);
            }
            "statement_block" => self.check_block(node),
            "if_statement" => self.check_if(node),
            "return_statement" | "throw_statement" => {
                for child in named_children(node) {
                    self.eval(child);
                }
            }
            "for_statement" => {
                self.push_scope();
                for field in ["initializer", "condition", "increment"] {
                    let Some(part) = node.child_by_field_name(field) else {
                        continue;
                    };
                    match part.kind() {
                        "lexical_declaration" | "variable_declaration" => {
                            self.hoist(&[part]);
                            self.check_declaration(part);
                        }
                        "expression_statement" | "empty_statement" => self.check_statement(part),
                        _ => {
                            self.eval(part);
                        }
                    }
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.check_block(body);
                }
                self.pop_scope();
            }
            "for_in_statement" => self.check_for_in(node),
            "while_statement" | "do_statement" => {
                if let Some(condition) = node.child_by_field_name("condition") {
                    self.eval(condition);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.check_block(body);
                }
            }
            "try_statement" => {
                if let Some(body) = node.child_by_field_name("body") {
                    self.check_block(body);
                }
                if let Some(handler) = node.child_by_field_name("handler") {
                    self.push_scope();
                    if let Some(param) = handler.child_by_field_name("parameter") {
                        self.bind_pattern(param, &TsType::Any, false);
                    }
                    if let Some(body) = handler.child_by_field_name("body") {
                        self.check_block(body);
                    }
                    self.pop_scope();
                }
                if let Some(finalizer) = node.child_by_field_name("finalizer") {
                    for child in named_children(finalizer) {
                        self.check_block(child);
                    }
                }
            }
            "switch_statement" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.eval(value);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.push_scope();
                    let cases = named_children(body);
                    let bodies: Vec<Vec<Node<'_>>> = cases.iter().map(|case| case_body(*case)).collect();
                    let statements: Vec<Node<'_>> = bodies.iter().flatten().copied().collect();
                    self.hoist(&statements);
                    for (case, body) in cases.iter().zip(bodies) {
                        if let Some(value) = case.child_by_field_name("value") {
                            self.eval(value);
                        }
                        for statement in body {
                            self.check_statement(statement);
                        }
                    }
                    self.pop_scope();
                }
            }
            "labeled_statement" => {
                if let Some(body) = node.child_by_field_name("body") {
                    self.check_statement(body);
                }
            }
            "break_statement" | "continue_statement" | "empty_statement" | "debugger_statement"
            | "comment" => {}
            _ => {
                for child in named_children(node) {
                    self.eval(child);
                }
            }
        }
    }

    fn check_declaration(&mut self, node: Node<'_>) {
        let constant = is_const(node);
        for declarator in named_children(node) {
            if declarator.kind() != "variable_declarator" {
                continue;
            }
            let annotated = declarator.child_by_field_name("type").is_some();
            let ty = match declarator.child_by_field_name("value") {
                Some(value) => {
                    let ty = self.eval(value);
                    if annotated {
                        TsType::Any
                    } else if constant {
                        ty
                    } else {
                        ty.widened()
                    }
                }
                None => TsType::Any,
            };
            if let Some(name) = declarator.child_by_field_name("name") {
                self.bind_pattern(name, &ty, constant);
            }
        }
    }

    fn check_if(&mut self, node: Node<'_>) {
        let Some(condition) = node.child_by_field_name("condition") else {
            return;
        };
        self.eval(condition);
        let when_true = self.facts(condition, true);
        let when_false = self.facts(condition, false);

        let consequence = node.child_by_field_name("consequence");
        if let Some(consequence) = consequence {
            self.with_facts(&when_true, |this| this.check_block(consequence));
        }
        let alternative = node
            .child_by_field_name("alternative")
            .and_then(|clause| named_children(clause).into_iter().next());
        if let Some(alternative) = alternative {
            self.with_facts(&when_false, |this| this.check_block(alternative));
        }

        let consequence_exits = consequence.is_some_and(always_exits);
        let alternative_exits = alternative.is_some_and(always_exits);
        if consequence_exits && !alternative_exits {
            self.apply_facts(&when_false);
        } else if alternative_exits && !consequence_exits {
            self.apply_facts(&when_true);
        }
    }

    fn check_for_in(&mut self, node: Node<'_>) {
        let right = node.child_by_field_name("right");
        let iterated = right.map(|r| self.eval(r)).unwrap_or(TsType::Any);
        let of_loop = node
            .child_by_field_name("operator")
            .is_some_and(|op| op.kind() == "of");
        let element = match (of_loop, iterated.resolved()) {
            (true, TsType::Array(element)) => (**element).clone(),
            (false, _) => TsType::String,
            _ => TsType::Any,
        };

        self.push_scope();
        if let Some(left) = node.child_by_field_name("left") {
            match node.child_by_field_name("kind") {
                Some(kind) => {
                    let constant = kind.kind() == "const";
                    self.bind_pattern(left, &element.widened(), constant);
                }
                None => self.assign_target(left),
            }
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.check_block(body);
        }
        self.pop_scope();
    }


    fn bind_pattern(&mut self, pattern: Node<'_>, ty: &TsType, constant: bool) {
        match pattern.kind() {
            "identifier" => self.declare(self.text(pattern), ty.clone(), constant),
            "shorthand_property_identifier_pattern" => {
                let name = self.text(pattern);
                let field_ty = self.destructured(ty, name, pattern);
                self.declare(name, field_ty, constant);
            }
            "object_pattern" => {
                for child in named_children(pattern) {
                    match child.kind() {
                        "pair_pattern" => {
                            let field_ty = match child.child_by_field_name("key") {
                                Some(key) if key.kind() == "property_identifier" => {
                                    let name = self.text(key);
                                    self.destructured(ty, name, key)
                                }
                                Some(key) => {
                                    self.eval(key);
                                    TsType::Any
                                }
                                None => TsType::Any,
                            };
                            if let Some(value) = child.child_by_field_name("value") {
                                self.bind_pattern(value, &field_ty, constant);
                            }
                        }
                        "object_assignment_pattern" => {
                            if let Some(right) = child.child_by_field_name("right") {
                                self.eval(right);
                            }
                            if let Some(left) = child.child_by_field_name("left") {
                                self.bind_pattern(left, ty, constant);
                            }
                        }
                        _ => self.bind_pattern(child, &TsType::Any, constant),
                    }
                }
            }
            "array_pattern" => {
                let element = match ty.resolved() {
                    TsType::Array(element) => (**element).clone(),
                    _ => TsType::Any,
                };
                for child in named_children(pattern) {
                    self.bind_pattern(child, &element, constant);
                }
            }
            "assignment_pattern" => {
                if let Some(right) = pattern.child_by_field_name("right") {
                    self.eval(right);
                }
                if let Some(left) = pattern.child_by_field_name("left") {
                    self.bind_pattern(left, ty, constant);
                }
            }
            "rest_pattern" => {
                for child in named_children(pattern) {
                    self.bind_pattern(child, &TsType::Any, constant);
                }
            }
            _ => {}
        }
    }

    /// Type of `name` pulled out of `ty` by destructuring
    fn destructured(&mut self, ty: &TsType, name: &str, at: Node<'_>) -> TsType {
        match ty.property(name) {
            Property::Found(found) => found,
            Property::Missing => {
                self.report(at, missing_property(name, ty));
                TsType::Any
            }
            Property::Unchecked => TsType::Any,
        }
    }

    /// Check the target of an assignment, `for..in` head or destructuring
    fn assign_target(&mut self, target: Node<'_>) {
        match target.kind() {
            "identifier" => {
                let name = self.text(target);
                match self.lookup(name).map(|binding| binding.constant) {
                    Some(true) => {
                        let message =
                            format!("Cannot assign to '{}' because it is a constant.", name);
                        self.report(target, message);
                    }
                    Some(false) => {
                        if let Some(binding) = self.lookup_mut(name) {
                            binding.current = binding.declared.clone();
                        }
                    }
                    None => {
                        if !is_es_global(name) && name != self.declarations.namespace {
                            self.report(target, format!("Cannot find name '{}'.", name));
                        }
                    }
                }
            }
            "member_expression" => {
                let Some(object) = target.child_by_field_name("object") else {
                    return;
                };
                let object_ty = self.eval(object);
                // `acc.key = value` on a `{}` accumulator.
                if object_ty.resolved() != &TsType::EmptyObject {
                    self.member(object_ty, target);
                }
            }
            "object_pattern" | "array_pattern" => {
                for child in named_children(target) {
                    match child.kind() {
                        "pair_pattern" => {
                            if let Some(value) = child.child_by_field_name("value") {
                                self.destructuring_write(value);
                            }
                        }
                        "shorthand_property_identifier_pattern" => self.assign_target(child),
                        _ => self.destructuring_write(child),
                    }
                }
            }
            "assignment_pattern" | "object_assignment_pattern" => {
                if let Some(right) = target.child_by_field_name("right") {
                    self.eval(right);
                }
                if let Some(left) = target.child_by_field_name("left") {
                    self.destructuring_write(left);
                }
            }
            "rest_pattern" => {
                for child in named_children(target) {
                    self.destructuring_write(child);
                }
            }
            "parenthesized_expression" => {
                for child in named_children(target) {
                    self.assign_target(child);
                }
            }
            _ => {
                self.eval(target);
            }
        }
    }

    /// Destructuring writes read the target shape, so `{}` members are errors
    fn destructuring_write(&mut self, target: Node<'_>) {
        if target.kind() == "member_expression" {
            if let Some(object) = target.child_by_field_name("object") {
                let object_ty = self.eval(object);
                self.member(object_ty, target);
            }
        } else {
            self.assign_target(target);
        }
    }


    /// Facts that hold when `condition` evaluates to `truthy`
    fn facts(&self, condition: Node<'_>, truthy: bool) -> Vec<Fact> {
        match condition.kind() {
            "parenthesized_expression" => named_children(condition)
                .last()
                .map(|inner| self.facts(*inner, truthy))
                .unwrap_or_default(),
            "unary_expression" => {
                let is_not = condition
                    .child_by_field_name("operator")
                    .is_some_and(|op| op.kind() == "!");
                match (is_not, condition.child_by_field_name("argument")) {
                    (true, Some(argument)) => self.facts(argument, !truthy),
                    _ => Vec::new(),
                }
            }
            "member_expression" => self
                .discriminant(condition)
                .map(|(var, field)| {
                    vec![Fact {
                        var,
                        field,
                        refinement: Refinement::Truthy(truthy),
                    }]
                })
                .unwrap_or_default(),
            "binary_expression" => {
                let operator = condition
                    .child_by_field_name("operator")
                    .map(|op| op.kind())
                    .unwrap_or("");
                let (Some(left), Some(right)) = (
                    condition.child_by_field_name("left"),
                    condition.child_by_field_name("right"),
                ) else {
                    return Vec::new();
                };
                match operator {
                    "&&" if truthy => {
                        let mut facts = self.facts(left, true);
                        facts.extend(self.facts(right, true));
                        facts
                    }
                    "||" if !truthy => {
                        let mut facts = self.facts(left, false);
                        facts.extend(self.facts(right, false));
                        facts
                    }
                    "===" | "==" | "!==" | "!=" => {
                        let equal = matches!(operator, "===" | "==") == truthy;
                        let pair = match (self.discriminant(left), literal_of(right, self.source)) {
                            (Some(target), Some(lit)) => Some((target, lit)),
                            _ => match (self.discriminant(right), literal_of(left, self.source)) {
                                (Some(target), Some(lit)) => Some((target, lit)),
                                _ => None,
                            },
                        };
                        pair.map(|((var, field), lit)| {
                            vec![Fact {
                                var,
                                field,
                                refinement: Refinement::Equals(lit, equal),
                            }]
                        })
                        .unwrap_or_default()
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// `x.field` with `x` a plain identifier
    fn discriminant(&self, node: Node<'_>) -> Option<(String, String)> {
        if node.kind() != "member_expression" {
            return None;
        }
        let object = node.child_by_field_name("object")?;
        let property = node.child_by_field_name("property")?;
        if object.kind() != "identifier" || property.kind() != "property_identifier" {
            return None;
        }
        Some((self.text(object).to_string(), self.text(property).to_string()))
    }


    fn eval(&mut self, node: Node<'_>) -> TsType {
        match node.kind() {
            "number" | "string" | "true" | "false" => literal_of(node, self.source)
                .map(TsType::Literal)
                .unwrap_or(TsType::Any),
            "template_string" => {
                for child in named_children(node) {
                    if child.kind() == "template_substitution" {
                        for expr in named_children(child) {
                            self.eval(expr);
                        }
                    }
                }
                TsType::String
            }
            "null" => TsType::Null,
            "undefined" => TsType::Undefined,
            "identifier" | "shorthand_property_identifier" => self.identifier(node),
            "this" | "super" | "regex" | "meta_property" => TsType::Any,
            "parenthesized_expression" | "sequence_expression" | "expression" => {
                let mut last = TsType::Any;
                for child in named_children(node) {
                    last = self.eval(child);
                }
                last
            }
            "object" => self.object_literal(node),
            "array" => {
                let elements: Vec<TsType> = named_children(node)
                    .into_iter()
                    .map(|child| self.eval(child).widened())
                    .collect();
                if elements.is_empty() {
                    TsType::array(TsType::Any)
                } else {
                    TsType::array(TsType::union(elements))
                }
            }
            "member_expression" => {
                let Some(object) = node.child_by_field_name("object") else {
                    return TsType::Any;
                };
                let object_ty = self.eval(object);
                self.member(object_ty, node)
            }
            "subscript_expression" => {
                let object_ty = node
                    .child_by_field_name("object")
                    .map(|object| self.eval(object))
                    .unwrap_or(TsType::Any);
                if let Some(index) = node.child_by_field_name("index") {
                    self.eval(index);
                }
                match object_ty.resolved() {
                    TsType::Array(element) => (**element).clone(),
                    _ => TsType::Any,
                }
            }
            "call_expression" => self.call(node),
            "new_expression" => {
                for child in named_children(node) {
                    if child.kind() == "arguments" {
                        for argument in named_children(child) {
                            self.eval(argument);
                        }
                    } else {
                        self.eval(child);
                    }
                }
                TsType::Any
            }
            "assignment_expression" => {
                let value = node
                    .child_by_field_name("right")
                    .map(|right| self.eval(right))
                    .unwrap_or(TsType::Any);
                if let Some(left) = node.child_by_field_name("left") {
                    self.assign_target(left);
                }
                value
            }
            "augmented_assignment_expression" => {
                // Compound assignment reads the target first.
                let target = node
                    .child_by_field_name("left")
                    .map(|left| self.eval(left))
                    .unwrap_or(TsType::Any);
                if let Some(right) = node.child_by_field_name("right") {
                    self.eval(right);
                }
                if let Some(left) = node.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        self.assign_target(left);
                    }
                }
                target.widened()
            }
            "update_expression" => {
                if let Some(argument) = node.child_by_field_name("argument") {
                    self.eval(argument);
                    if argument.kind() == "identifier" {
                        self.assign_target(argument);
                    }
                }
                TsType::Number
            }
            "unary_expression" => {
                let operator = node
                    .child_by_field_name("operator")
                    .map(|op| op.kind())
                    .unwrap_or("");
                if let Some(argument) = node.child_by_field_name("argument") {
                    self.eval(argument);
                }
                match operator {
                    "!" | "delete" => TsType::Boolean,
                    "typeof" => TsType::String,
                    "void" => TsType::Undefined,
                    _ => TsType::Number,
                }
            }
            "binary_expression" => self.binary(node),
            "ternary_expression" => {
                let Some(condition) = node.child_by_field_name("condition") else {
                    return TsType::Any;
                };
                self.eval(condition);
                let when_true = self.facts(condition, true);
                let when_false = self.facts(condition, false);
                let consequence = node
                    .child_by_field_name("consequence")
                    .map(|c| self.with_facts(&when_true, |this| this.eval(c)))
                    .unwrap_or(TsType::Any);
                let alternative = node
                    .child_by_field_name("alternative")
                    .map(|a| self.with_facts(&when_false, |this| this.eval(a)))
                    .unwrap_or(TsType::Any);
                TsType::union([consequence, alternative])
            }
            "arrow_function" | "function_expression" | "function" | "generator_function" => {
                self.push_scope();
                if let Some(name) = node.child_by_field_name("name") {
                    self.declare(self.text(name), TsType::Any, false);
                }
                self.check_function(node);
                self.pop_scope();
                TsType::Any
            }
            "class" => {
                self.check_class(node);
                TsType::Any
            }
            "await_expression" | "spread_element" | "non_null_expression" => named_children(node)
                .into_iter()
                .map(|child| self.eval(child))
                .last()
                .unwrap_or(TsType::Any),
            "as_expression" | "satisfies_expression" | "type_assertion" => {
                if let Some(inner) = named_children(node).into_iter().next() {
                    self.eval(inner);
                }
                TsType::Any
            }
            "yield_expression" => {
                for child in named_children(node) {
                    self.eval(child);
                }
                TsType::Any
            }
            _ => {
                for child in named_children(node) {
                    self.eval(child);
                }
                TsType::Any
            }
        }
    }

    fn identifier(&mut self, node: Node<'_>) -> TsType {
        let name = self.text(node);
        if let Some(binding) = self.lookup(name) {
            return binding.current.clone();
        }
        if name == self.declarations.namespace {
            return TsType::Namespace(name.to_string());
        }
        if name == "undefined" {
            return TsType::Undefined;
        }
        if is_es_global(name) {
            return TsType::Any;
        }
        self.report(node, format!("Cannot find name '{}'.", name));
        TsType::Any
    }

    /// Read the property named by `member` (a `member_expression`) from `object_ty`
    fn member(&mut self, object_ty: TsType, member: Node<'_>) -> TsType {
        let Some(property) = member.child_by_field_name("property") else {
            return TsType::Any;
        };
        if property.kind() != "property_identifier" {
            return TsType::Any;
        }
        let name = self.text(property);

        if let TsType::Namespace(namespace) = object_ty.resolved() {
            return match self.declarations.tool(name) {
                Some(signature) => signature.function_type(),
                None => {
                    let message = format!(
                        "Property '{}' does not exist on type 'typeof {}'.",
                        name, namespace
                    );
                    self.report(property, message);
                    TsType::Any
                }
            };
        }
        if OBJECT_PROTOTYPE_MEMBERS.contains(&name) {
            return TsType::Any;
        }
        match object_ty.property(name) {
            Property::Found(ty) => ty,
            Property::Missing => {
                self.report(property, missing_property(name, &object_ty));
                TsType::Any
            }
            Property::Unchecked => TsType::Any,
        }
    }

    fn binary(&mut self, node: Node<'_>) -> TsType {
        let operator = node
            .child_by_field_name("operator")
            .map(|op| op.kind())
            .unwrap_or("");
        let left = node.child_by_field_name("left");
        let right = node.child_by_field_name("right");
        let left_ty = left.map(|l| self.eval(l)).unwrap_or(TsType::Any);

        let right_ty = match (operator, left, right) {
            ("&&", Some(left), Some(right)) => {
                let facts = self.facts(left, true);
                self.with_facts(&facts, |this| this.eval(right))
            }
            ("||", Some(left), Some(right)) => {
                let facts = self.facts(left, false);
                self.with_facts(&facts, |this| this.eval(right))
            }
            (_, _, Some(right)) => self.eval(right),
            _ => TsType::Any,
        };

        match operator {
            "&&" | "||" | "??" => TsType::Any,
            "===" | "!==" | "==" | "!=" | "<" | ">" | "<=" | ">=" | "in" | "instanceof" => {
                TsType::Boolean
            }
            "+" => {
                let is = |ty: &TsType, primitive: &TsType| ty.widened().resolved() == primitive;
                if is(&left_ty, &TsType::String) || is(&right_ty, &TsType::String) {
                    TsType::String
                } else if is(&left_ty, &TsType::Number) && is(&right_ty, &TsType::Number) {
                    TsType::Number
                } else {
                    TsType::Any
                }
            }
            _ => TsType::Number,
        }
    }

    fn call(&mut self, node: Node<'_>) -> TsType {
        let Some(callee) = node.child_by_field_name("function") else {
            return TsType::Any;
        };
        let arguments: Vec<Node<'_>> = node
            .child_by_field_name("arguments")
            .filter(|args| args.kind() == "arguments")
            .map(named_children)
            .unwrap_or_default();

        if let Some(signature) = self.tool_callee(callee) {
            self.check_tool_arguments(node, &signature, &arguments);
            return signature.result.clone();
        }

        let callee_ty = self.eval(callee);
        for argument in &arguments {
            self.eval(*argument);
        }
        match callee_ty.resolved() {
            TsType::Function(function) => function.ret.clone(),
            _ => TsType::Any,
        }
    }

    /// The tool signature when `callee` is `<namespace>.<known tool>`
    fn tool_callee(&self, callee: Node<'_>) -> Option<std::sync::Arc<ToolSignature>> {
        if callee.kind() != "member_expression" {
            return None;
        }
        let object = callee.child_by_field_name("object")?;
        let property = callee.child_by_field_name("property")?;
        if object.kind() != "identifier" || property.kind() != "property_identifier" {
            return None;
        }
        let name = self.text(object);
        if name != self.declarations.namespace || self.lookup(name).is_some() {
            return None;
        }
        self.declarations.tools.get(self.text(property)).cloned()
    }

    fn check_tool_arguments(&mut self, call: Node<'_>, signature: &ToolSignature, arguments: &[Node<'_>]) {
        let spread = arguments.iter().any(|a| a.kind() == "spread_element");
        if !spread {
            if arguments.is_empty() && signature.args.has_required_fields() {
                self.report(call, "Expected 1 arguments, but got 0.");
            }
            if arguments.len() > 1 {
                let message = format!("Expected 1 arguments, but got {}.", arguments.len());
                self.report(arguments[1], message);
            }
        }

        let Some(first) = arguments.first() else {
            return;
        };
        if first.kind() == "object" {
            self.check_object_literal(*first, &signature.args);
        } else {
            let actual = self.eval(*first);
            let expected = TsType::Object(signature.args.clone());
            if first.kind() != "spread_element" && !expected.accepts(&actual) {
                let message = format!(
                    "Argument of type '{}' is not assignable to parameter of type '{}'.",
                    actual.widened(),
                    expected
                );
                self.report(*first, message);
            }
        }
        for extra in arguments.iter().skip(1) {
            self.eval(*extra);
        }
    }

    /// Check an object literal against the shape it is passed as
    fn check_object_literal(&mut self, node: Node<'_>, target: &ObjectType) {
        let target_name = TsType::Object(target.clone()).to_string();
        let mut present: Vec<Field> = Vec::new();
        let mut spread = false;

        for member in named_children(node) {
            let (name, key_node, value) = match member.kind() {
                "pair" => {
                    let Some(key) = member.child_by_field_name("key") else {
                        continue;
                    };
                    let value = member.child_by_field_name("value");
                    match property_name(key, self.source) {
                        Some(name) => (name, key, value),
                        None => {
                            self.eval(key);
                            if let Some(value) = value {
                                self.eval(value);
                            }
                            spread = true;
                            continue;
                        }
                    }
                }
                "shorthand_property_identifier" => (self.text(member).to_string(), member, None),
                "method_definition" => {
                    let name = member
                        .child_by_field_name("name")
                        .and_then(|n| property_name(n, self.source));
                    self.check_function(member);
                    match name {
                        Some(name) => {
                            present.push(Field::required(name, TsType::Any));
                        }
                        None => spread = true,
                    }
                    continue;
                }
                "spread_element" => {
                    self.eval(member);
                    spread = true;
                    continue;
                }
                _ => continue,
            };

            let expected = match target.field(&name) {
                Some(field) if field.optional => Some(TsType::union([field.ty.clone(), TsType::Undefined])),
                Some(field) => Some(field.ty.clone()),
                None => target.index.as_ref().map(|index| (**index).clone()),
            };
            let actual = match expected {
                Some(expected) => match value {
                    Some(value) => self.check_value(value, &expected, key_node),
                    None => {
                        let actual = self.eval(member);
                        self.report_mismatch(&actual, &expected, key_node);
                        actual
                    }
                },
                None => {
                    let message = format!(
                        "Object literal may only specify known properties, and '{}' does not exist in type '{}'.",
                        name, target_name
                    );
                    self.report(key_node, message);
                    match value {
                        Some(value) => self.eval(value),
                        None => self.eval(member),
                    }
                }
            };
            present.push(Field::required(name, actual.widened()));
        }

        if spread {
            return;
        }
        let missing: Vec<&str> = target
            .required_fields()
            .filter(|field| !present.iter().any(|p| p.name == field.name))
            .map(|field| field.name.as_str())
            .collect();
        let literal = ObjectType::new(present.clone()).render_inline();
        match missing.as_slice() {
            [] => {}
            [single] => {
                let message = format!(
                    "Property '{}' is missing in type '{}' but required in type '{}'.",
                    single, literal, target_name
                );
                self.report(node, message);
            }
            several => {
                let message = format!(
                    "Type '{}' is missing the following properties from type '{}': {}",
                    literal,
                    target_name,
                    several.join(", ")
                );
                self.report(node, message);
            }
        }
    }

    /// Check `value` against `expected` in a contextually typed position
    fn check_value(&mut self, value: Node<'_>, expected: &TsType, report_at: Node<'_>) -> TsType {
        if expected.is_permissive() {
            return self.eval(value);
        }
        match (value.kind(), expected.resolved()) {
            ("object", TsType::Object(shape)) => {
                let shape = shape.clone();
                self.check_object_literal(value, &shape);
                return TsType::Object(shape);
            }
            ("array", TsType::Array(element)) => {
                let element = (**element).clone();
                for item in named_children(value) {
                    if item.kind() == "spread_element" {
                        self.eval(item);
                    } else {
                        self.check_value(item, &element, item);
                    }
                }
                return TsType::array(element);
            }
            _ => {}
        }
        let actual = self.eval(value);
        self.report_mismatch(&actual, expected, report_at);
        actual
    }

    fn report_mismatch(&mut self, actual: &TsType, expected: &TsType, at: Node<'_>) {
        if expected.accepts(actual) {
            return;
        }
        let shown = if has_literals(expected) {
            actual.clone()
        } else {
            actual.widened()
        };
        let message = format!("Type '{}' is not assignable to type '{}'.", shown, expected);
        self.report(at, message);
    }

    fn object_literal(&mut self, node: Node<'_>) -> TsType {
        let members = named_children(node);
        if members.is_empty() {
            return TsType::EmptyObject;
        }
        let mut fields = Vec::new();
        let mut open = false;
        for member in members {
            match member.kind() {
                "pair" => {
                    let name = member
                        .child_by_field_name("key")
                        .and_then(|key| property_name(key, self.source));
                    if name.is_none() {
                        if let Some(key) = member.child_by_field_name("key") {
                            self.eval(key);
                        }
                        open = true;
                    }
                    let ty = member
                        .child_by_field_name("value")
                        .map(|value| self.eval(value).widened())
                        .unwrap_or(TsType::Any);
                    if let Some(name) = name {
                        fields.push(Field::required(name, ty));
                    }
                }
                "shorthand_property_identifier" => {
                    let ty = self.eval(member).widened();
                    fields.push(Field::required(self.text(member), ty));
                }
                "method_definition" => {
                    if let Some(name) = member
                        .child_by_field_name("name")
                        .and_then(|n| property_name(n, self.source))
                    {
                        fields.push(Field::required(name, TsType::Any));
                    } else {
                        open = true;
                    }
                    self.check_function(member);
                }
                _ => {
                    self.eval(member);
                    open = true;
                }
            }
        }
        let shape = ObjectType::new(fields);
        if open {
            TsType::Object(shape.with_index(TsType::Any))
        } else {
            TsType::Object(shape)
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn missing_property(name: &str, on: &TsType) -> String {
    format!("Property '{}' does not exist on type '{}'.", name, on)
}

fn has_literals(ty: &TsType) -> bool {
    match ty.resolved() {
        TsType::Literal(_) => true,
        TsType::Union(members) => members.iter().any(has_literals),
        _ => false,
    }
}

/// Literal value of a number, string or boolean node
fn literal_of(node: Node<'_>, source: &str) -> Option<Literal> {
    let text = node_text(node, source);
    match node.kind() {
        "true" => Some(Literal::Bool(true)),
        "false" => Some(Literal::Bool(false)),
        "number" => text.replace('_', "").parse().ok().map(Literal::Number),
        "string" => Some(Literal::String(unquote(text).to_string())),
        _ => None,
    }
}

fn unquote(text: &str) -> &str {
    if text.len() >= 2 {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

/// Static name of an object key
fn property_name(key: Node<'_>, source: &str) -> Option<String> {
    match key.kind() {
        "property_identifier" | "identifier" | "number" => Some(node_text(key, source).to_string()),
        "string" => Some(unquote(node_text(key, source)).to_string()),
        _ => None,
    }
}

fn case_body(case: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = case.walk();
    let body: Vec<Node<'_>> = case.children_by_field_name("body", &mut cursor).collect();
    body
}

/// Whether control never falls off the end of `node`
fn always_exits(node: Node<'_>) -> bool {
    match node.kind() {
        "return_statement" | "throw_statement" | "break_statement" | "continue_statement" => true,
        "statement_block" => named_children(node).into_iter().any(always_exits),
        "if_statement" => {
            let consequence = node.child_by_field_name("consequence").is_some_and(always_exits);
            let alternative = node
                .child_by_field_name("alternative")
                .and_then(|clause| named_children(clause).into_iter().next())
                .is_some_and(always_exits);
            consequence && alternative
        }
        _ => false,
    }
}

/// Names bound by a binding pattern
fn pattern_names<'s>(pattern: Node<'_>, source: &'s str, out: &mut Vec<&'s str>) {
    match pattern.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => out.push(node_text(pattern, source)),
        "pair_pattern" => {
            if let Some(value) = pattern.child_by_field_name("value") {
                pattern_names(value, source, out);
            }
        }
        "assignment_pattern" | "object_assignment_pattern" => {
            if let Some(left) = pattern.child_by_field_name("left") {
                pattern_names(left, source, out);
            }
        }
        "object_pattern" | "array_pattern" | "rest_pattern" => {
            for child in named_children(pattern) {
                pattern_names(child, source, out);
            }
        }
        _ => {}
    }
}

/// `var` names declared anywhere in a function body, excluding nested functions
fn collect_var_names<'s>(node: Node<'_>, source: &'s str, out: &mut Vec<&'s str>) {
    for child in named_children(node) {
        match child.kind() {
            "variable_declaration" => {
                for declarator in named_children(child) {
                    if let Some(name) = declarator.child_by_field_name("name") {
                        pattern_names(name, source, out);
                    }
                }
            }
            "function_declaration"
            | "generator_function_declaration"
            | "function_expression"
            | "function"
            | "arrow_function"
            | "generator_function"
            | "method_definition"
            | "class_declaration"
            | "class" => {}
            _ => collect_var_names(child, source, out),
        }
    }
}
