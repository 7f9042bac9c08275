//! Name mappings and the filter/compute grammar.
//!
//! Filters look like `keep(a,b)`, `remove(a)`, `rename({dst:src})`.
//! Compute strings look like `[pos,dir] = xflow.skin(pos,dir)` or, in the
//! bracketed form, `[pos,dir](xflow.skin)(pos,dir)`.

use crate::error::{XflowError, XflowResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref FILTER_RE: Regex = Regex::new(r"^([A-Za-z\s]*)\(([\s\S]*)\)$").unwrap();
    static ref BRACES_RE: Regex = Regex::new(r"^\{([\s\S]*)\}$").unwrap();
    static ref BRACKETS_RE: Regex = Regex::new(r"^\[([^\]]*)\]$").unwrap();
    static ref NAME_RE: Regex = Regex::new(r"^[^\s,:{}\[\]()=]+$").unwrap();
    static ref PAIR_RE: Regex = Regex::new(r"^([^\s,:{}]+)\s*:\s*([^\s,:{}]+)$").unwrap();
    static ref COMPUTE_ASSIGN_RE: Regex =
        Regex::new(r"^(?:([^=()]+)=)?\s*([^()=\s][^()=]*?)\s*\(([^()]*)\)$").unwrap();
    static ref COMPUTE_CALL_RE: Regex =
        Regex::new(r"^([^()=]*)\(\s*([^()=\s]+)\s*\)\s*\(([^()]*)\)$").unwrap();
}

/// How a filter treats the names in its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    /// Pass everything, renaming per the mapping.
    #[default]
    Rename,
    /// Pass only the mapped names.
    Keep,
    /// Pass everything except the mapped names.
    Remove,
}

impl FilterType {
    fn keyword(self) -> &'static str {
        match self {
            FilterType::Rename => "rename",
            FilterType::Keep => "keep",
            FilterType::Remove => "remove",
        }
    }
}

/// Positional name list, e.g. `a,b,c`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderMapping {
    names: Vec<String>,
}

impl OrderMapping {
    /// Build from names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Names in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn parse(list: &str) -> XflowResult<Self> {
        let list = list.trim();
        if list.is_empty() {
            return Ok(Self::default());
        }
        let mut names = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if !NAME_RE.is_match(part) {
                return Err(XflowError::MappingSyntax(list.to_string()));
            }
            names.push(part.to_string());
        }
        Ok(Self { names })
    }
}

/// `{dest:src,...}` rename table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameMapping {
    pairs: Vec<(String, String)>,
}

impl NameMapping {
    /// Build from `(dest, src)` pairs.
    pub fn new<I, D, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (D, S)>,
        D: Into<String>,
        S: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(d, s)| (d.into(), s.into()))
                .collect(),
        }
    }

    /// `(dest, src)` pairs in declaration order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    fn source_for(&self, dest: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(d, _)| d == dest)
            .map(|(_, s)| s.as_str())
    }

    fn dest_for(&self, src: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(_, s)| s == src)
            .map(|(d, _)| d.as_str())
    }

    fn has_source(&self, src: &str) -> bool {
        self.pairs.iter().any(|(_, s)| s == src)
    }

    fn parse(body: &str) -> XflowResult<Self> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(Self::default());
        }
        let mut pairs = Vec::new();
        for part in body.split(',') {
            let caps = PAIR_RE
                .captures(part.trim())
                .ok_or_else(|| XflowError::MappingSyntax(body.to_string()))?;
            pairs.push((caps[1].to_string(), caps[2].to_string()));
        }
        Ok(Self { pairs })
    }
}

/// Either a positional list or a rename table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    /// Positional list.
    Order(OrderMapping),
    /// Rename table.
    Name(NameMapping),
}

impl Default for Mapping {
    fn default() -> Self {
        Mapping::Order(OrderMapping::default())
    }
}

impl Mapping {
    /// Parse `a,b,c` or `{dest:src,...}`.
    pub fn parse(text: &str) -> XflowResult<Self> {
        let text = text.trim();
        match BRACES_RE.captures(text) {
            Some(caps) => Ok(Mapping::Name(NameMapping::parse(&caps[1])?)),
            None => Ok(Mapping::Order(OrderMapping::parse(text)?)),
        }
    }

    /// No names at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Mapping::Order(m) => m.names.is_empty(),
            Mapping::Name(m) => m.pairs.is_empty(),
        }
    }

    /// Channel feeding operator parameter `index`, declared with `source`.
    pub fn input_name(&self, index: usize, source: &str) -> String {
        let mapped = match self {
            Mapping::Order(m) => m.names.get(index).map(String::as_str),
            Mapping::Name(m) => m.source_for(source),
        };
        mapped.unwrap_or(source).to_string()
    }

    /// Channel name for operator output `index`, declared as `declared`.
    pub fn output_name(&self, index: usize, declared: &str) -> String {
        let mapped = match self {
            Mapping::Order(m) => m.names.get(index).map(String::as_str),
            Mapping::Name(m) => m.dest_for(declared),
        };
        mapped.unwrap_or(declared).to_string()
    }

    /// Apply a filter to the available names, returning `(dest, src)` pairs
    /// in the order they should be merged.
    pub fn apply_filter<S: AsRef<str>>(
        &self,
        filter_type: FilterType,
        available: &[S],
    ) -> Vec<(String, String)> {
        let identity = |name: &str| (name.to_string(), name.to_string());
        match self {
            Mapping::Order(m) => available
                .iter()
                .map(AsRef::as_ref)
                .filter(|name| {
                    let listed = m.names.iter().any(|n| n == name);
                    match filter_type {
                        FilterType::Rename => true,
                        FilterType::Keep => listed,
                        FilterType::Remove => !listed,
                    }
                })
                .map(identity)
                .collect(),
            Mapping::Name(m) => {
                let mut out: Vec<(String, String)> = Vec::new();
                if filter_type != FilterType::Keep {
                    out.extend(
                        available
                            .iter()
                            .map(AsRef::as_ref)
                            .filter(|name| !m.has_source(name))
                            .map(identity),
                    );
                }
                if filter_type != FilterType::Remove {
                    for (dest, src) in &m.pairs {
                        if available.iter().any(|n| n.as_ref() == src) {
                            out.push((dest.clone(), src.clone()));
                        }
                    }
                }
                out
            }
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapping::Order(m) => write!(f, "{}", m.names.join(",")),
            Mapping::Name(m) => {
                let pairs: Vec<String> = m.pairs.iter().map(|(d, s)| format!("{d}:{s}")).collect();
                write!(f, "{{{}}}", pairs.join(","))
            }
        }
    }
}

/// Parsed `filter` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Filter {
    /// Filter kind.
    pub filter_type: FilterType,
    /// Names the filter talks about.
    pub mapping: Mapping,
}

impl Filter {
    /// Pass-through filter.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Parse a filter string. An empty string yields `None` (no filter).
    pub fn parse(text: &str) -> XflowResult<Option<Self>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let caps = FILTER_RE
            .captures(text)
            .ok_or_else(|| XflowError::FilterSyntax(text.to_string()))?;
        let filter_type = match caps[1].trim() {
            "keep" => FilterType::Keep,
            "remove" => FilterType::Remove,
            "rename" => FilterType::Rename,
            _ => return Err(XflowError::FilterSyntax(text.to_string())),
        };
        let mapping = Mapping::parse(&caps[2])
            .map_err(|_| XflowError::FilterSyntax(text.to_string()))?;
        Ok(Some(Self {
            filter_type,
            mapping,
        }))
    }

    /// `(dest, src)` pairs that pass the filter.
    pub fn apply<S: AsRef<str>>(&self, available: &[S]) -> Vec<(String, String)> {
        self.mapping.apply_filter(self.filter_type, available)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.filter_type.keyword(), self.mapping)
    }
}

/// Parsed `compute` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compute {
    /// Operator name, e.g. `xflow.normalize`.
    pub operator: String,
    /// Maps operator parameters to input channel names.
    pub inputs: Mapping,
    /// Maps operator outputs to output channel names.
    pub outputs: Mapping,
}

impl Compute {
    /// Parse a compute string. An empty string yields `None` (no operator).
    pub fn parse(text: &str) -> XflowResult<Option<Self>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let err = || XflowError::ComputeSyntax(text.to_string());
        let (outputs, operator, inputs) = if let Some(caps) = COMPUTE_CALL_RE.captures(text) {
            (
                caps.get(1).map_or("", |m| m.as_str()).to_string(),
                caps[2].to_string(),
                caps[3].to_string(),
            )
        } else if let Some(caps) = COMPUTE_ASSIGN_RE.captures(text) {
            (
                caps.get(1).map_or("", |m| m.as_str()).to_string(),
                caps[2].trim().to_string(),
                caps[3].to_string(),
            )
        } else {
            return Err(err());
        };

        let outputs = outputs.trim();
        let outputs = match BRACKETS_RE.captures(outputs) {
            Some(caps) => caps[1].to_string(),
            None => outputs.to_string(),
        };
        Ok(Some(Self {
            operator,
            inputs: Mapping::parse(&inputs).map_err(|_| err())?,
            outputs: Mapping::parse(&outputs).map_err(|_| err())?,
        }))
    }
}

impl fmt::Display for Compute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outputs.is_empty() {
            write!(f, "{}({})", self.operator, self.inputs)
        } else {
            write!(f, "[{}] = {}({})", self.outputs, self.operator, self.inputs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(pairs: &[(String, String)]) -> Vec<&str> {
        pairs.iter().map(|(d, _)| d.as_str()).collect()
    }

    #[test]
    fn keep_and_remove_partition_names() {
        let available = ["a", "b", "c"];
        let keep = Filter::parse("keep(a,b)").unwrap().unwrap();
        let remove = Filter::parse("remove(a, b)").unwrap().unwrap();
        assert_eq!(names(&keep.apply(&available)), vec!["a", "b"]);
        assert_eq!(names(&remove.apply(&available)), vec!["c"]);
    }

    #[test]
    fn rename_table_maps_sources() {
        let filter = Filter::parse("rename({pos:position})").unwrap().unwrap();
        let out = filter.apply(&["position", "normal"]);
        assert_eq!(
            out,
            vec![
                ("normal".to_string(), "normal".to_string()),
                ("pos".to_string(), "position".to_string())
            ]
        );
        let keep = Filter::parse("keep({pos:position})").unwrap().unwrap();
        assert_eq!(names(&keep.apply(&["position", "normal"])), vec!["pos"]);
    }

    #[test]
    fn bad_filters_are_errors() {
        assert!(Filter::parse("explode(a)").is_err());
        assert!(Filter::parse("keep a,b").is_err());
        assert!(Filter::parse("keep({a})").is_err());
        assert_eq!(Filter::parse("  ").unwrap(), None);
    }

    #[test]
    fn compute_assign_form() {
        let c = Compute::parse("[pos, dir] = xflow.skin(position, normal)")
            .unwrap()
            .unwrap();
        assert_eq!(c.operator, "xflow.skin");
        assert_eq!(c.outputs.output_name(1, "dir"), "dir");
        assert_eq!(c.outputs.output_name(0, "result"), "pos");
        assert_eq!(c.inputs.input_name(1, "normal"), "normal");
    }

    #[test]
    fn compute_call_form() {
        let c = Compute::parse("result(xflow.normalize)(value)").unwrap().unwrap();
        assert_eq!(c.operator, "xflow.normalize");
        assert_eq!(c.outputs, Mapping::Order(OrderMapping::new(["result"])));
        assert_eq!(c.inputs, Mapping::Order(OrderMapping::new(["value"])));

        let c = Compute::parse("[a,b](xflow.op)({x:y})").unwrap().unwrap();
        assert_eq!(c.outputs, Mapping::Order(OrderMapping::new(["a", "b"])));
        assert_eq!(c.inputs.input_name(0, "x"), "y");
    }

    #[test]
    fn compute_without_outputs_keeps_declared_names() {
        let c = Compute::parse("xflow.normalize(value)").unwrap().unwrap();
        assert!(c.outputs.is_empty());
        assert_eq!(c.outputs.output_name(0, "result"), "result");
        assert_eq!(c.inputs.input_name(3, "weight"), "weight");
    }

    #[test]
    fn compute_garbage_is_error() {
        assert!(Compute::parse("= (").is_err());
        assert!(Compute::parse("a = b = c(d)").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let filter = Filter::parse("keep({a:b,c:d})").unwrap().unwrap();
        assert_eq!(Filter::parse(&filter.to_string()).unwrap(), Some(filter));
        let compute = Compute::parse("[p,q] = xflow.op(x,y)").unwrap().unwrap();
        assert_eq!(Compute::parse(&compute.to_string()).unwrap(), Some(compute));
    }
}
