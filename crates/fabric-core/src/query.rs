//! Graph path queries
//!
//! Some identifiers are not exposed by CRUD endpoints (the aggregate link of
//! a LAG group, the interfaces at either end of a link). They are found by
//! walking the blueprint graph with a chain of node and relationship
//! matchers:
//!
//! ```text
//! node(type='system', id='gs1')
//!   .out(type='hosted_interfaces')
//!   .node(type='interface', if_type='port_channel')
//!   .out(type='link')
//!   .node(type='link', group_label='bond0', name='n_link')
//! ```
//!
//! A `name` attribute binds the matched node into each result item under
//! that name. [`PathQuery`] renders to the controller's query language via
//! `Display` and can be evaluated locally against a [`Graph`].

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Value side of an attribute predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    /// Attribute equals the string
    Eq(String),
    /// Attribute equals any of the strings
    IsIn(Vec<String>),
}

impl QueryValue {
    fn matches(&self, actual: &str) -> bool {
        match self {
            QueryValue::Eq(expected) => expected == actual,
            QueryValue::IsIn(options) => options.iter().any(|o| o == actual),
        }
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Eq(v) => write!(f, "'{}'", escape(v)),
            QueryValue::IsIn(vs) => {
                f.write_str("is_in([")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{}'", escape(v))?;
                }
                f.write_str("])")
            }
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// A single `key=value` predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    /// Attribute name
    pub key: String,
    /// Expected value
    pub value: QueryValue,
}

/// `key == value`
pub fn attr(key: impl Into<String>, value: impl Into<String>) -> Attr {
    Attr {
        key: key.into(),
        value: QueryValue::Eq(value.into()),
    }
}

/// `key in values`
pub fn attr_in<I, S>(key: impl Into<String>, values: I) -> Attr
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Attr {
        key: key.into(),
        value: QueryValue::IsIn(values.into_iter().map(Into::into).collect()),
    }
}

/// Node or relationship type predicate
pub fn of_type(t: impl Into<String>) -> Attr {
    attr("type", t)
}

/// Bind the matched node into result items under `name`
pub fn named(name: impl Into<String>) -> Attr {
    attr("name", name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Node(Vec<Attr>),
    Out(Vec<Attr>),
    In(Vec<Attr>),
}

/// Builder for a path query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathQuery {
    steps: Vec<Step>,
}

impl PathQuery {
    /// Empty query
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a node
    pub fn node(mut self, attrs: impl IntoIterator<Item = Attr>) -> Self {
        self.steps.push(Step::Node(attrs.into_iter().collect()));
        self
    }

    /// Follow an outgoing relationship
    pub fn out(mut self, attrs: impl IntoIterator<Item = Attr>) -> Self {
        self.steps.push(Step::Out(attrs.into_iter().collect()));
        self
    }

    /// Follow an incoming relationship
    pub fn in_(mut self, attrs: impl IntoIterator<Item = Attr>) -> Self {
        self.steps.push(Step::In(attrs.into_iter().collect()));
        self
    }

    /// Whether the query has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn check_shape(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            let expect_node = i % 2 == 0;
            let is_node = matches!(step, Step::Node(_));
            if expect_node != is_node {
                return Err(Error::validation(
                    "query",
                    format!("step {i} must be a {}", if expect_node { "node" } else { "relationship" }),
                ));
            }
        }
        if self.steps.is_empty() || self.steps.len() % 2 == 0 {
            return Err(Error::validation("query", "query must start and end with a node"));
        }
        Ok(())
    }
}

impl fmt::Display for PathQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            let (verb, attrs) = match step {
                Step::Node(a) => ("node", a),
                Step::Out(a) => ("out", a),
                Step::In(a) => ("in_", a),
            };
            write!(f, "{verb}(")?;
            for (j, a) in attrs.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}={}", a.key, a.value)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// A node in an in-memory graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Node ID
    pub id: String,
    /// Node type (system, interface, link, ...)
    pub node_type: String,
    /// Other attributes
    pub attrs: BTreeMap<String, String>,
}

impl GraphNode {
    fn matches(&self, attrs: &[Attr]) -> bool {
        attrs.iter().all(|a| match a.key.as_str() {
            "name" => true,
            "id" => a.value.matches(&self.id),
            "type" => a.value.matches(&self.node_type),
            key => self.attrs.get(key).is_some_and(|v| a.value.matches(v)),
        })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert("type".into(), Value::String(self.node_type.clone()));
        for (k, v) in &self.attrs {
            obj.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(obj)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GraphEdge {
    rel_type: String,
    source: String,
    target: String,
}

/// Minimal directed property graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
}

impl Graph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node
    pub fn add_node<I, K, V>(&mut self, id: impl Into<String>, node_type: impl Into<String>, attrs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let id = id.into();
        self.nodes.insert(
            id.clone(),
            GraphNode {
                id,
                node_type: node_type.into(),
                attrs: attrs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            },
        );
    }

    /// Add a relationship from `source` to `target`
    pub fn add_edge(&mut self, rel_type: impl Into<String>, source: impl Into<String>, target: impl Into<String>) {
        self.edges.push(GraphEdge {
            rel_type: rel_type.into(),
            source: source.into(),
            target: target.into(),
        });
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Run `query`, returning one JSON object per matched path with the
    /// named nodes as keys
    pub fn evaluate(&self, query: &PathQuery) -> Result<Vec<Value>> {
        query.check_shape()?;

        let Step::Node(first) = &query.steps[0] else {
            unreachable!("check_shape guarantees a leading node step");
        };

        let mut paths: Vec<(&GraphNode, Map<String, Value>)> = self
            .nodes
            .values()
            .filter(|n| n.matches(first))
            .map(|n| (n, bind(Map::new(), first, n)))
            .collect();

        for pair in query.steps[1..].chunks(2) {
            let (edge_step, node_attrs) = match pair {
                [edge, Step::Node(node_attrs)] => (edge, node_attrs),
                _ => unreachable!("check_shape guarantees alternating steps"),
            };

            let mut next = Vec::new();
            for (current, bindings) in &paths {
                for neighbor in self.neighbors(current, edge_step) {
                    if neighbor.matches(node_attrs) {
                        next.push((neighbor, bind(bindings.clone(), node_attrs, neighbor)));
                    }
                }
            }
            paths = next;
        }

        Ok(paths.into_iter().map(|(_, b)| Value::Object(b)).collect())
    }

    fn neighbors<'a>(&'a self, node: &'a GraphNode, step: &'a Step) -> impl Iterator<Item = &'a GraphNode> + 'a {
        let (outgoing, attrs) = match step {
            Step::Out(a) => (true, a),
            Step::In(a) => (false, a),
            Step::Node(a) => (true, a),
        };
        self.edges
            .iter()
            .filter(move |e| {
                let endpoint = if outgoing { &e.source } else { &e.target };
                endpoint == &node.id
                    && attrs.iter().all(|a| match a.key.as_str() {
                        "type" => a.value.matches(&e.rel_type),
                        _ => true,
                    })
            })
            .filter_map(move |e| self.nodes.get(if outgoing { &e.target } else { &e.source }))
    }
}

fn bind(mut bindings: Map<String, Value>, attrs: &[Attr], node: &GraphNode) -> Map<String, Value> {
    for a in attrs {
        if a.key == "name"
            && let QueryValue::Eq(name) = &a.value
        {
            bindings.insert(name.clone(), node.to_json());
        }
    }
    bindings
}

/// Pull `item[name].id` out of every result item
pub fn ids_named(items: &[Value], name: &str) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get(name)?.get("id")?.as_str().map(str::to_string))
        .collect()
}
