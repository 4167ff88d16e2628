//! Graphviz DOT reader and writer for pipeline dumps.
//!
//! Covers the subset that pipeline dumps use: `strict`/`graph`/`digraph`,
//! attribute lists and defaults, `a=b` statements, node and edge statements
//! with ports, edge chains and nested subgraphs. Subgraphs whose id starts
//! with `cluster` are kept as [`DotCluster`]s; other subgraphs only scope
//! their statements. Attribute values are stored as written, except that
//! `\"` is unescaped; HTML-like values keep their `<...>` delimiters.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub type Attrs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DotParseError {
    #[error("empty graph description")]
    Empty,
    #[error("line {line}: unexpected {found}, expected {expected}")]
    Unexpected {
        line: usize,
        found: String,
        expected: &'static str,
    },
    #[error("line {line}: unterminated {what}")]
    Unterminated { line: usize, what: &'static str },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error("line {line}: {feature} are not supported")]
    Unsupported { line: usize, feature: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DotGraph {
    pub name: String,
    pub directed: bool,
    pub strict: bool,
    pub attrs: Attrs,
    pub node_defaults: Attrs,
    pub edge_defaults: Attrs,
    pub nodes: Vec<DotNode>,
    pub edges: Vec<DotEdge>,
    pub clusters: Vec<DotCluster>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotNode {
    pub id: String,
    pub attrs: Attrs,
    /// Innermost cluster the node was first placed in.
    pub cluster: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotEdge {
    pub from: String,
    pub to: String,
    pub from_port: Option<String>,
    pub to_port: Option<String>,
    pub attrs: Attrs,
}

/// A `subgraph cluster*` block. Clusters are stored parent-first, so a
/// cluster's index is always greater than its parent's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotCluster {
    pub id: String,
    pub attrs: Attrs,
    pub parent: Option<usize>,
}

/// Split a DOT label on its `\n`, `\l` and `\r` line escapes.
pub fn label_lines(label: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = label.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.peek().copied() {
                if matches!(next, 'n' | 'l' | 'r') {
                    chars.next();
                    lines.push(std::mem::take(&mut current));
                    continue;
                }
            }
        }
        current.push(ch);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

impl DotNode {
    pub fn display_label(&self) -> String {
        match self.attrs.get("label") {
            Some(label) if label != "\\N" => label_lines(label)
                .into_iter()
                .map(|line| line.trim().to_string())
                .find(|line| !line.is_empty())
                .unwrap_or_else(|| self.id.clone()),
            _ => self.id.clone(),
        }
    }

    pub fn is_invisible(&self) -> bool {
        is_invisible(&self.attrs)
    }
}

impl DotCluster {
    /// Element or bin name: the second label line for GStreamer-style
    /// `Type\nname\nstate` labels, else the label, else the id.
    pub fn display_name(&self) -> String {
        let lines = self
            .attrs
            .get("label")
            .map(|label| label_lines(label))
            .unwrap_or_default();
        match lines.as_slice() {
            [_, name, ..] => name.trim().to_string(),
            [only] => only.trim().to_string(),
            [] => self
                .id
                .strip_prefix("cluster_")
                .unwrap_or(&self.id)
                .to_string(),
        }
    }

    pub fn has_label(&self) -> bool {
        self.attrs
            .get("label")
            .map(|label| label_lines(label).iter().any(|line| !line.trim().is_empty()))
            .unwrap_or(false)
    }

    pub fn is_invisible(&self) -> bool {
        is_invisible(&self.attrs)
    }
}

fn is_invisible(attrs: &Attrs) -> bool {
    attrs
        .get("style")
        .map(|style| style.split(',').any(|part| part.trim() == "invis"))
        .unwrap_or(false)
}

impl DotGraph {
    pub fn parse(source: &str) -> Result<Self, DotParseError> {
        if source.trim().is_empty() {
            return Err(DotParseError::Empty);
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            graph: DotGraph::default(),
            node_index: HashMap::new(),
        };
        parser.parse_graph()?;
        Ok(parser.graph)
    }

    pub fn display_name(&self) -> String {
        let lines = self
            .attrs
            .get("label")
            .map(|label| label_lines(label))
            .unwrap_or_default();
        match lines.as_slice() {
            [_, name, ..] => name.trim().to_string(),
            [only] => only.trim().to_string(),
            [] => self.name.clone(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&DotNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn cluster_children(&self, parent: Option<usize>) -> impl Iterator<Item = usize> + '_ {
        self.clusters
            .iter()
            .enumerate()
            .filter(move |(_, cluster)| cluster.parent == parent)
            .map(|(idx, _)| idx)
    }

    /// A bin is a cluster holding at least one labelled child cluster;
    /// unlabelled children are pad groups.
    pub fn is_bin(&self, cluster: usize) -> bool {
        self.cluster_children(Some(cluster))
            .any(|child| self.clusters[child].has_label())
    }

    pub fn find_bin(&self, name: &str) -> Option<usize> {
        (0..self.clusters.len())
            .find(|idx| self.is_bin(*idx) && self.clusters[*idx].display_name() == name)
    }

    /// Names of the bins directly inside `bin_name` (or the graph root when
    /// empty). `None` when the bin does not exist.
    pub fn child_bin_names(&self, bin_name: &str) -> Option<Vec<String>> {
        let parent = if bin_name.is_empty() {
            None
        } else {
            Some(self.find_bin(bin_name)?)
        };
        Some(
            self.cluster_children(parent)
                .filter(|idx| self.is_bin(*idx))
                .map(|idx| self.clusters[idx].display_name())
                .collect(),
        )
    }

    fn cluster_is_within(&self, cluster: usize, ancestor: usize) -> bool {
        let mut current = Some(cluster);
        while let Some(idx) = current {
            if idx == ancestor {
                return true;
            }
            current = self.clusters[idx].parent;
        }
        false
    }

    /// Cut the named bin out as a standalone graph: its clusters, the nodes
    /// placed inside it and the edges between those nodes.
    pub fn extract_bin(&self, bin_name: &str) -> Option<DotGraph> {
        let root = self.find_bin(bin_name)?;
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut clusters = Vec::new();
        for (idx, cluster) in self.clusters.iter().enumerate() {
            if idx == root || !self.cluster_is_within(idx, root) {
                continue;
            }
            let parent = cluster
                .parent
                .filter(|parent| *parent != root)
                .and_then(|parent| remap.get(&parent).copied());
            remap.insert(idx, clusters.len());
            clusters.push(DotCluster {
                id: cluster.id.clone(),
                attrs: cluster.attrs.clone(),
                parent,
            });
        }

        let nodes: Vec<DotNode> = self
            .nodes
            .iter()
            .filter(|node| {
                node.cluster
                    .map(|cluster| self.cluster_is_within(cluster, root))
                    .unwrap_or(false)
            })
            .map(|node| DotNode {
                id: node.id.clone(),
                attrs: node.attrs.clone(),
                cluster: node.cluster.and_then(|cluster| remap.get(&cluster).copied()),
            })
            .collect();

        let edges = self
            .edges
            .iter()
            .filter(|edge| {
                nodes.iter().any(|node| node.id == edge.from)
                    && nodes.iter().any(|node| node.id == edge.to)
            })
            .cloned()
            .collect();

        Some(DotGraph {
            name: self.clusters[root].display_name(),
            directed: self.directed,
            strict: self.strict,
            attrs: self.clusters[root].attrs.clone(),
            node_defaults: self.node_defaults.clone(),
            edge_defaults: self.edge_defaults.clone(),
            nodes,
            edges,
            clusters,
        })
    }

    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        if self.strict {
            out.push_str("strict ");
        }
        out.push_str(if self.directed { "digraph" } else { "graph" });
        if !self.name.is_empty() {
            out.push(' ');
            out.push_str(&quote(&self.name));
        }
        out.push_str(" {\n");
        if !self.attrs.is_empty() {
            out.push_str(&format!("  graph {};\n", format_attrs(&self.attrs)));
        }
        if !self.node_defaults.is_empty() {
            out.push_str(&format!("  node {};\n", format_attrs(&self.node_defaults)));
        }
        if !self.edge_defaults.is_empty() {
            out.push_str(&format!("  edge {};\n", format_attrs(&self.edge_defaults)));
        }
        for cluster in self.cluster_children(None) {
            self.write_cluster(&mut out, cluster, 1);
        }
        for node in self.nodes.iter().filter(|node| node.cluster.is_none()) {
            write_node(&mut out, node, 1);
        }
        let op = if self.directed { "->" } else { "--" };
        for edge in &self.edges {
            let mut line = format!(
                "  {} {op} {}",
                endpoint(&edge.from, edge.from_port.as_deref()),
                endpoint(&edge.to, edge.to_port.as_deref())
            );
            if !edge.attrs.is_empty() {
                line.push(' ');
                line.push_str(&format_attrs(&edge.attrs));
            }
            line.push_str(";\n");
            out.push_str(&line);
        }
        out.push_str("}\n");
        out
    }

    fn write_cluster(&self, out: &mut String, cluster: usize, depth: usize) {
        let indent = "  ".repeat(depth);
        let entry = &self.clusters[cluster];
        out.push_str(&format!("{indent}subgraph {} {{\n", quote(&entry.id)));
        for (key, value) in &entry.attrs {
            out.push_str(&format!("{indent}  {}={};\n", quote(key), quote(value)));
        }
        for child in self.cluster_children(Some(cluster)) {
            self.write_cluster(out, child, depth + 1);
        }
        for node in self
            .nodes
            .iter()
            .filter(|node| node.cluster == Some(cluster))
        {
            write_node(out, node, depth + 1);
        }
        out.push_str(&format!("{indent}}}\n"));
    }
}

fn write_node(out: &mut String, node: &DotNode, depth: usize) {
    let indent = "  ".repeat(depth);
    if node.attrs.is_empty() {
        out.push_str(&format!("{indent}{};\n", quote(&node.id)));
    } else {
        out.push_str(&format!(
            "{indent}{} {};\n",
            quote(&node.id),
            format_attrs(&node.attrs)
        ));
    }
}

fn endpoint(id: &str, port: Option<&str>) -> String {
    let mut value = quote(id);
    if let Some(port) = port {
        for part in port.split(':') {
            value.push(':');
            value.push_str(&quote(part));
        }
    }
    value
}

fn quote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('<') && value.ends_with('>') {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('"', "\\\""))
}

fn format_attrs(attrs: &Attrs) -> String {
    let fields: Vec<String> = attrs
        .iter()
        .map(|(key, value)| format!("{}={}", quote(key), quote(value)))
        .collect();
    format!("[{}]", fields.join(", "))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Id(String),
    Quoted(String),
    Html(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Colon,
    Equals,
    Arrow,
    Line,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Id(value) => format!("'{value}'"),
            Tok::Quoted(value) => format!("\"{value}\""),
            Tok::Html(_) => "HTML string".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::Semi => "';'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::Equals => "'='".to_string(),
            Tok::Arrow => "'->'".to_string(),
            Tok::Line => "'--'".to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Tok::Id(value) if value.eq_ignore_ascii_case(keyword))
    }

    fn is_id(&self) -> bool {
        matches!(self, Tok::Id(_) | Tok::Quoted(_) | Tok::Html(_))
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn is_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || !ch.is_ascii()
}

fn read_quoted(chars: &[char], i: &mut usize, line: &mut usize) -> Result<String, DotParseError> {
    let start_line = *line;
    let mut value = String::new();
    *i += 1;
    loop {
        let Some(&ch) = chars.get(*i) else {
            return Err(DotParseError::Unterminated {
                line: start_line,
                what: "string",
            });
        };
        match ch {
            '"' => {
                *i += 1;
                return Ok(value);
            }
            '\\' if *i + 1 < chars.len() => {
                let next = chars[*i + 1];
                match next {
                    '"' => value.push('"'),
                    '\n' => *line += 1,
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
                *i += 2;
            }
            _ => {
                if ch == '\n' {
                    *line += 1;
                }
                value.push(ch);
                *i += 1;
            }
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, DotParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut line_start = true;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        if ch == '\n' {
            line += 1;
            line_start = true;
            i += 1;
            continue;
        }
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        if (ch == '#' && line_start) || (ch == '/' && next == Some('/')) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        line_start = false;
        if ch == '/' && next == Some('*') {
            let start_line = line;
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(DotParseError::Unterminated {
                        line: start_line,
                        what: "comment",
                    });
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            continue;
        }

        let token_line = line;
        let tok = match ch {
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            ';' => Tok::Semi,
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            '=' => Tok::Equals,
            '-' if next == Some('>') => {
                i += 1;
                Tok::Arrow
            }
            '-' if next == Some('-') => {
                i += 1;
                Tok::Line
            }
            '"' => {
                let mut value = read_quoted(&chars, &mut i, &mut line)?;
                // "a" + "b" concatenation
                loop {
                    let mut j = i;
                    let mut skipped_lines = 0;
                    while j < chars.len() && chars[j].is_whitespace() {
                        if chars[j] == '\n' {
                            skipped_lines += 1;
                        }
                        j += 1;
                    }
                    if chars.get(j) != Some(&'+') {
                        break;
                    }
                    j += 1;
                    while j < chars.len() && chars[j].is_whitespace() {
                        if chars[j] == '\n' {
                            skipped_lines += 1;
                        }
                        j += 1;
                    }
                    if chars.get(j) != Some(&'"') {
                        break;
                    }
                    i = j;
                    line += skipped_lines;
                    value.push_str(&read_quoted(&chars, &mut i, &mut line)?);
                }
                tokens.push(Token {
                    tok: Tok::Quoted(value),
                    line: token_line,
                });
                continue;
            }
            '<' => {
                let start = i + 1;
                let mut depth = 1;
                i += 1;
                while depth > 0 {
                    let Some(&inner) = chars.get(i) else {
                        return Err(DotParseError::Unterminated {
                            line: token_line,
                            what: "HTML string",
                        });
                    };
                    match inner {
                        '<' => depth += 1,
                        '>' => depth -= 1,
                        '\n' => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
                let content: String = chars[start..i - 1].iter().collect();
                tokens.push(Token {
                    tok: Tok::Html(format!("<{content}>")),
                    line: token_line,
                });
                continue;
            }
            '-' | '.' | '0'..='9' => {
                let start = i;
                if ch == '-' {
                    i += 1;
                }
                let mut digits = 0;
                let mut seen_dot = false;
                while let Some(&c) = chars.get(i) {
                    if c.is_ascii_digit() {
                        digits += 1;
                    } else if c == '.' && !seen_dot {
                        seen_dot = true;
                    } else {
                        break;
                    }
                    i += 1;
                }
                if digits == 0 {
                    return Err(DotParseError::Unexpected {
                        line: token_line,
                        found: format!("'{ch}'"),
                        expected: "a numeral",
                    });
                }
                // Identifiers such as `0x55d0_src` start with digits.
                while let Some(&c) = chars.get(i) {
                    if !is_id_char(c) {
                        break;
                    }
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Id(chars[start..i].iter().collect()),
                    line: token_line,
                });
                continue;
            }
            c if is_id_char(c) => {
                let start = i;
                while i < chars.len() && is_id_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Id(chars[start..i].iter().collect()),
                    line: token_line,
                });
                continue;
            }
            other => {
                return Err(DotParseError::Unexpected {
                    line: token_line,
                    found: format!("'{other}'"),
                    expected: "a token",
                });
            }
        };
        tokens.push(Token {
            tok,
            line: token_line,
        });
        i += 1;
    }

    Ok(tokens)
}

#[derive(Clone, Copy)]
enum AttrTarget {
    Root,
    Cluster(usize),
    Discard,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    graph: DotGraph,
    node_index: HashMap<String, usize>,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|token| &token.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|token| &token.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|token| token.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Tok> {
        let token = self.tokens.get(self.pos).map(|token| token.tok.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, expected: &'static str) -> DotParseError {
        match self.peek() {
            Some(tok) => DotParseError::Unexpected {
                line: self.line(),
                found: tok.describe(),
                expected,
            },
            None => DotParseError::UnexpectedEof { expected },
        }
    }

    fn expect(&mut self, want: Tok, expected: &'static str) -> Result<(), DotParseError> {
        if self.peek() == Some(&want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_id(&mut self, expected: &'static str) -> Result<String, DotParseError> {
        match self.peek() {
            Some(Tok::Id(value)) | Some(Tok::Quoted(value)) | Some(Tok::Html(value)) => {
                let value = value.clone();
                self.pos += 1;
                Ok(value)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn parse_graph(&mut self) -> Result<(), DotParseError> {
        if self.peek().map(|tok| tok.is_keyword("strict")).unwrap_or(false) {
            self.graph.strict = true;
            self.pos += 1;
        }
        match self.peek() {
            Some(tok) if tok.is_keyword("digraph") => self.graph.directed = true,
            Some(tok) if tok.is_keyword("graph") => self.graph.directed = false,
            _ => return Err(self.unexpected("'graph' or 'digraph'")),
        }
        self.pos += 1;
        if self.peek().map(Tok::is_id).unwrap_or(false) {
            self.graph.name = self.expect_id("graph name")?;
        }
        self.expect(Tok::LBrace, "'{'")?;
        self.parse_stmt_list(None, AttrTarget::Root)?;
        self.expect(Tok::RBrace, "'}'")?;
        if self.peek().is_some() {
            return Err(self.unexpected("end of input"));
        }
        Ok(())
    }

    fn parse_stmt_list(
        &mut self,
        cluster: Option<usize>,
        target: AttrTarget,
    ) -> Result<(), DotParseError> {
        loop {
            match self.peek() {
                None => return Err(DotParseError::UnexpectedEof { expected: "'}'" }),
                Some(Tok::RBrace) => return Ok(()),
                Some(Tok::Semi) => {
                    self.pos += 1;
                }
                Some(_) => self.parse_stmt(cluster, target)?,
            }
        }
    }

    fn apply_graph_attrs(&mut self, target: AttrTarget, attrs: Attrs) {
        match target {
            AttrTarget::Root => self.graph.attrs.extend(attrs),
            AttrTarget::Cluster(idx) => self.graph.clusters[idx].attrs.extend(attrs),
            AttrTarget::Discard => {}
        }
    }

    fn parse_stmt(
        &mut self,
        cluster: Option<usize>,
        target: AttrTarget,
    ) -> Result<(), DotParseError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(DotParseError::UnexpectedEof {
                expected: "a statement",
            });
        };

        let is_attr_keyword =
            tok.is_keyword("graph") || tok.is_keyword("node") || tok.is_keyword("edge");
        if is_attr_keyword && self.peek_at(1) == Some(&Tok::LBracket) {
            self.pos += 1;
            let attrs = self.parse_attr_lists()?;
            if tok.is_keyword("graph") {
                self.apply_graph_attrs(target, attrs);
            } else if matches!(target, AttrTarget::Root) {
                if tok.is_keyword("node") {
                    self.graph.node_defaults.extend(attrs);
                } else {
                    self.graph.edge_defaults.extend(attrs);
                }
            }
            return Ok(());
        }

        if tok.is_keyword("subgraph") || tok == Tok::LBrace {
            self.parse_subgraph(cluster)?;
            if matches!(self.peek(), Some(Tok::Arrow) | Some(Tok::Line)) {
                return Err(DotParseError::Unsupported {
                    line: self.line(),
                    feature: "subgraph edge operands",
                });
            }
            return Ok(());
        }

        let id = self.expect_id("a statement")?;
        if self.peek() == Some(&Tok::Equals) {
            self.pos += 1;
            let value = self.expect_id("an attribute value")?;
            let mut attrs = Attrs::new();
            attrs.insert(id, value);
            self.apply_graph_attrs(target, attrs);
            return Ok(());
        }

        let port = self.parse_port()?;
        if matches!(self.peek(), Some(Tok::Arrow) | Some(Tok::Line)) {
            let mut endpoints = vec![(id, port)];
            while let Some(op) = self.peek().cloned() {
                let matches_kind = match op {
                    Tok::Arrow => self.graph.directed,
                    Tok::Line => !self.graph.directed,
                    _ => break,
                };
                if !matches_kind {
                    return Err(self.unexpected(if self.graph.directed {
                        "'->'"
                    } else {
                        "'--'"
                    }));
                }
                self.pos += 1;
                if matches!(self.peek(), Some(Tok::LBrace))
                    || self.peek().map(|tok| tok.is_keyword("subgraph")).unwrap_or(false)
                {
                    return Err(DotParseError::Unsupported {
                        line: self.line(),
                        feature: "subgraph edge operands",
                    });
                }
                let next_id = self.expect_id("an edge target")?;
                let next_port = self.parse_port()?;
                endpoints.push((next_id, next_port));
            }
            let attrs = if self.peek() == Some(&Tok::LBracket) {
                self.parse_attr_lists()?
            } else {
                Attrs::new()
            };
            for (node_id, _) in &endpoints {
                self.ensure_node(node_id, cluster);
            }
            for pair in endpoints.windows(2) {
                self.graph.edges.push(DotEdge {
                    from: pair[0].0.clone(),
                    to: pair[1].0.clone(),
                    from_port: pair[0].1.clone(),
                    to_port: pair[1].1.clone(),
                    attrs: attrs.clone(),
                });
            }
            return Ok(());
        }

        let attrs = if self.peek() == Some(&Tok::LBracket) {
            self.parse_attr_lists()?
        } else {
            Attrs::new()
        };
        self.declare_node(id, cluster, attrs);
        Ok(())
    }

    fn parse_port(&mut self) -> Result<Option<String>, DotParseError> {
        if self.peek() != Some(&Tok::Colon) {
            return Ok(None);
        }
        self.pos += 1;
        let mut port = self.expect_id("a port")?;
        if self.peek() == Some(&Tok::Colon) {
            self.pos += 1;
            let compass = self.expect_id("a compass point")?;
            port = format!("{port}:{compass}");
        }
        Ok(Some(port))
    }

    fn parse_subgraph(&mut self, cluster: Option<usize>) -> Result<(), DotParseError> {
        let mut id = None;
        if self.peek().map(|tok| tok.is_keyword("subgraph")).unwrap_or(false) {
            self.pos += 1;
            if self.peek().map(Tok::is_id).unwrap_or(false) {
                id = Some(self.expect_id("a subgraph name")?);
            }
        }
        self.expect(Tok::LBrace, "'{'")?;
        match id {
            Some(id) if id.starts_with("cluster") => {
                let idx = self.graph.clusters.len();
                self.graph.clusters.push(DotCluster {
                    id,
                    attrs: Attrs::new(),
                    parent: cluster,
                });
                self.parse_stmt_list(Some(idx), AttrTarget::Cluster(idx))?;
            }
            _ => self.parse_stmt_list(cluster, AttrTarget::Discard)?,
        }
        self.expect(Tok::RBrace, "'}'")
    }

    fn parse_attr_lists(&mut self) -> Result<Attrs, DotParseError> {
        let mut attrs = Attrs::new();
        while self.peek() == Some(&Tok::LBracket) {
            self.pos += 1;
            loop {
                match self.peek() {
                    Some(Tok::RBracket) => {
                        self.pos += 1;
                        break;
                    }
                    Some(Tok::Semi) | Some(Tok::Comma) => {
                        self.pos += 1;
                    }
                    None => return Err(DotParseError::UnexpectedEof { expected: "']'" }),
                    Some(_) => {
                        let key = self.expect_id("an attribute name")?;
                        let value = if self.peek() == Some(&Tok::Equals) {
                            self.pos += 1;
                            self.expect_id("an attribute value")?
                        } else {
                            "true".to_string()
                        };
                        attrs.insert(key, value);
                    }
                }
            }
        }
        Ok(attrs)
    }

    fn ensure_node(&mut self, id: &str, cluster: Option<usize>) {
        if self.node_index.contains_key(id) {
            return;
        }
        self.node_index
            .insert(id.to_string(), self.graph.nodes.len());
        self.graph.nodes.push(DotNode {
            id: id.to_string(),
            attrs: Attrs::new(),
            cluster,
        });
    }

    fn declare_node(&mut self, id: String, cluster: Option<usize>, attrs: Attrs) {
        if let Some(idx) = self.node_index.get(&id).copied() {
            let node = &mut self.graph.nodes[idx];
            node.attrs.extend(attrs);
            if node.cluster.is_none() {
                node.cluster = cluster;
            }
            return;
        }
        self.node_index.insert(id.clone(), self.graph.nodes.len());
        self.graph.nodes.push(DotNode { id, attrs, cluster });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const GST_DUMP: &str = r#"digraph pipeline {
  rankdir=LR;
  fontname="sans";
  label="<GstPipeline>\npipeline0\n[>]";
  node [style="filled,rounded", shape=box, fontsize="9"];
  edge [labelfontsize="6"];

  subgraph cluster_src_0x1 {
    fontname="Bitstream Vera Sans";
    label="GstVideoTestSrc\nsrc\n[>]";
    subgraph cluster_src_0x1_src {
      label="";
      style="invis";
      src_0x1_src_0x2 [color=black, label="src\n[>][bfb]"];
    }
  }
  subgraph cluster_decodebin_0x3 {
    label="GstBin\ndecodebin\n[>]";
    subgraph cluster_decodebin_0x3_sink {
      label="";
      style="invis";
      decodebin_0x3_sink_0x4 [label="sink"];
    }
    subgraph cluster_queue_0x5 {
      label="GstQueue\nqueue\n[>]";
      subgraph cluster_queue_0x5_sink {
        label="";
        queue_0x5_sink_0x6 [label="sink"];
      }
    }
    subgraph cluster_inner_0x7 {
      label="GstBin\ninner\n[>]";
      subgraph cluster_conv_0x8 {
        label="GstVideoConvert\nconv\n[>]";
        conv_0x8_sink [label="sink"];
      }
    }
  }
  // links
  src_0x1_src_0x2 -> decodebin_0x3_sink_0x4 [label="video/x-raw"];
  decodebin_0x3_sink_0x4 -> queue_0x5_sink_0x6 -> conv_0x8_sink;
}
"#;

    #[test]
    fn parses_gstreamer_style_dump() {
        let graph = DotGraph::parse(GST_DUMP).expect("parse");
        assert!(graph.directed);
        assert_eq!(graph.name, "pipeline");
        assert_eq!(graph.display_name(), "pipeline0");
        assert_eq!(graph.attrs.get("rankdir").map(String::as_str), Some("LR"));
        assert_eq!(graph.node_defaults.get("shape").map(String::as_str), Some("box"));
        assert_eq!(graph.clusters.len(), 8);
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.edges.len(), 3);
        assert_eq!(graph.edges[0].attrs.get("label").map(String::as_str), Some("video/x-raw"));
        assert_eq!(graph.edges[2].from, "queue_0x5_sink_0x6");
        assert_eq!(graph.edges[2].to, "conv_0x8_sink");

        let pad = graph.node("src_0x1_src_0x2").expect("pad node");
        assert_eq!(pad.display_label(), "src");
        assert_eq!(graph.clusters[pad.cluster.expect("cluster")].id, "cluster_src_0x1_src");
    }

    #[test]
    fn bins_are_clusters_with_labelled_children() {
        let graph = DotGraph::parse(GST_DUMP).expect("parse");
        assert_eq!(graph.child_bin_names(""), Some(vec!["decodebin".to_string()]));
        assert_eq!(graph.child_bin_names("decodebin"), Some(vec!["inner".to_string()]));
        assert_eq!(graph.child_bin_names("inner"), Some(Vec::new()));
        assert_eq!(graph.child_bin_names("queue"), None);
        assert_eq!(graph.child_bin_names("missing"), None);
    }

    #[test]
    fn extracted_bin_is_a_standalone_graph() {
        let graph = DotGraph::parse(GST_DUMP).expect("parse");
        let bin = graph.extract_bin("decodebin").expect("bin");
        assert_eq!(bin.name, "decodebin");
        assert_eq!(bin.clusters.len(), 5);
        assert_eq!(bin.nodes.len(), 3);
        assert_eq!(bin.edges.len(), 2);
        assert!(bin.clusters.iter().all(|cluster| cluster.id != "cluster_decodebin_0x3"));

        let reparsed = DotGraph::parse(&bin.to_dot()).expect("reparse");
        assert_eq!(reparsed.child_bin_names(""), Some(vec!["inner".to_string()]));
        assert_eq!(reparsed.nodes.len(), 3);
        assert_eq!(reparsed.edges.len(), 2);
    }

    #[test]
    fn written_graph_parses_to_the_same_model() {
        let graph = DotGraph::parse(GST_DUMP).expect("parse");
        let reparsed = DotGraph::parse(&graph.to_dot()).expect("reparse");
        assert_eq!(reparsed, graph);
    }

    #[test]
    fn handles_comments_ports_and_concatenation() {
        let source = r#"
# preprocessor-style line
strict graph "g" {
  /* block
     comment */
  a:out:e -- b:in [label="x" + "y", weight=2];
  b -- c -- a;
  c [label=<<b>bold</b>>];
  subgraph { d; }
  -1.5 -- e;
}
"#;
        let graph = DotGraph::parse(source).expect("parse");
        assert!(graph.strict);
        assert!(!graph.directed);
        assert_eq!(graph.edges.len(), 4);
        assert_eq!(graph.edges[0].from_port.as_deref(), Some("out:e"));
        assert_eq!(graph.edges[0].to_port.as_deref(), Some("in"));
        assert_eq!(graph.edges[0].attrs.get("label").map(String::as_str), Some("xy"));
        assert_eq!(
            graph.node("c").and_then(|node| node.attrs.get("label")).map(String::as_str),
            Some("<<b>bold</b>>")
        );
        assert!(graph.node("d").is_some());
        assert!(graph.node("-1.5").is_some());
        assert!(graph.clusters.is_empty());
    }

    #[test]
    fn rejects_malformed_input_with_line_numbers() {
        assert_eq!(DotGraph::parse("  \n"), Err(DotParseError::Empty));
        assert!(matches!(
            DotGraph::parse("digraph g {\n a -> ;\n}"),
            Err(DotParseError::Unexpected { line: 2, .. })
        ));
        assert!(matches!(
            DotGraph::parse("digraph g { a [label=\"open ]; }"),
            Err(DotParseError::Unterminated { what: "string", .. })
        ));
        assert!(matches!(
            DotGraph::parse("digraph g { a -- b; }"),
            Err(DotParseError::Unexpected { .. })
        ));
        assert!(matches!(
            DotGraph::parse("digraph g { a -> { b c } }"),
            Err(DotParseError::Unsupported { .. })
        ));
        assert!(matches!(
            DotGraph::parse("digraph g { a -> b;"),
            Err(DotParseError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn label_lines_split_on_escapes() {
        assert_eq!(
            label_lines("GstBin\\nbin0\\l[>]"),
            vec!["GstBin".to_string(), "bin0".to_string(), "[>]".to_string()]
        );
        assert!(label_lines("").is_empty());
    }
}
