use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

/// Variable context predicates are evaluated against. The full conditional
/// language belongs to the bundle authoring layer; the engine only consumes
/// name/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationContext {
    variables: BTreeMap<String, String>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ctx = Self::new();
        for pair in pairs {
            let raw = pair.as_ref();
            let (name, value) = raw
                .split_once('=')
                .ok_or_else(|| anyhow!("variable must be name=value: {raw}"))?;
            if name.trim().is_empty() {
                return Err(anyhow!("variable name must not be empty: {raw}"));
            }
            ctx.set(name.trim(), value.trim());
        }
        Ok(ctx)
    }
}

/// A parsed applicability or presence condition.
///
/// Supported forms: `true`, `false`, `defined NAME`, `NAME = value`,
/// `NAME != value`, each optionally prefixed with `not `.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Always(bool),
    Defined(String),
    Equals(String, String),
    NotEquals(String, String),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("predicate must not be empty"));
        }

        if let Some(rest) = trimmed.strip_prefix("not ") {
            return Ok(Self::Not(Box::new(Self::parse(rest)?)));
        }

        match trimmed {
            "true" => return Ok(Self::Always(true)),
            "false" => return Ok(Self::Always(false)),
            _ => {}
        }

        if let Some(rest) = trimmed.strip_prefix("defined ") {
            let name = rest.trim();
            validate_variable_name(name)?;
            return Ok(Self::Defined(name.to_string()));
        }

        if let Some((name, value)) = trimmed.split_once("!=") {
            let name = name.trim();
            validate_variable_name(name)?;
            return Ok(Self::NotEquals(name.to_string(), value.trim().to_string()));
        }

        if let Some((name, value)) = trimmed.split_once('=') {
            let name = name.trim();
            validate_variable_name(name)?;
            return Ok(Self::Equals(name.to_string(), value.trim().to_string()));
        }

        Err(anyhow!("unsupported predicate form: {trimmed}"))
    }

    pub fn evaluate(&self, ctx: &EvaluationContext) -> bool {
        match self {
            Self::Always(value) => *value,
            Self::Defined(name) => ctx.get(name).is_some(),
            Self::Equals(name, value) => ctx.get(name) == Some(value.as_str()),
            Self::NotEquals(name, value) => ctx.get(name) != Some(value.as_str()),
            Self::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

fn validate_variable_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("predicate variable name must not be empty"));
    }

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(anyhow!("predicate variable name must not be empty"));
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(anyhow!(
            "predicate variable name must start with a letter or underscore: {name}"
        ));
    }
    if chars.any(|ch| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')) {
        return Err(anyhow!(
            "predicate variable name contains invalid character(s): {name}"
        ));
    }

    Ok(())
}
