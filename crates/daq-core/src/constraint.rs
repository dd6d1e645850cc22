//! Attribute constraints.
//!
//! Agents advertise attributes (`role=FLP`, `site=p2`, ...) on every offer.
//! Task classes and workflow roles declare constraints over those
//! attributes; the matcher only places a descriptor on an offer whose
//! attributes satisfy the descriptor's combined constraint set.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single `name=value` attribute advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: &str, value: &str) -> Self {
        Self { name: name.to_string(), value: value.to_string() }
    }
}

/// The ordered attribute list of one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(pub Vec<Attribute>);

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Every constraint must hold; an empty constraint set always holds.
    pub fn satisfy(&self, constraints: &Constraints) -> bool {
        constraints.0.iter().all(|c| c.matches(self))
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|a| format!("{}={}", a.name, a.value))
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// How a constraint compares an attribute against its expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
}

/// One attribute requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub operator: Operator,
    pub value: String,
}

impl Constraint {
    pub fn equals(attribute: &str, value: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            operator: Operator::Equals,
            value: value.to_string(),
        }
    }

    fn matches(&self, attributes: &Attributes) -> bool {
        match self.operator {
            Operator::Equals => attributes.get(&self.attribute) == Some(self.value.as_str()),
        }
    }
}

/// A conjunction of constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints(pub Vec<Constraint>);

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combine two constraint sets, deduplicating exact repeats.
    pub fn merged_with(&self, other: &Constraints) -> Constraints {
        let mut combined = self.0.clone();
        for c in &other.0 {
            if !combined.contains(c) {
                combined.push(c.clone());
            }
        }
        Constraints(combined)
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|c| format!("{}=={}", c.attribute, c.value))
            .collect();
        write!(f, "{}", rendered.join(" && "))
    }
}
