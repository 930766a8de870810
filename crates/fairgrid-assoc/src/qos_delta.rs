//! QOS list deltas.
//!
//! Administrators edit an association's QOS list with prefixed tokens:
//! `+name` appends, `-name` removes, and `=name` or a bare `name` replaces
//! the whole list. The first replacing token clears the list once; later
//! replacing tokens in the same batch append to the new list.

/// One parsed QOS list instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QosOp {
    Add(String),
    Remove(String),
    Replace(String),
}

/// Parse tokens into instructions. Empty names are dropped.
pub fn parse_qos_delta<S: AsRef<str>>(tokens: &[S]) -> Vec<QosOp> {
    tokens
        .iter()
        .filter_map(|token| {
            let token = token.as_ref().trim();
            let (op, name): (fn(String) -> QosOp, &str) =
                if let Some(name) = token.strip_prefix('+') {
                    (QosOp::Add, name)
                } else if let Some(name) = token.strip_prefix('-') {
                    (QosOp::Remove, name)
                } else if let Some(name) = token.strip_prefix('=') {
                    (QosOp::Replace, name)
                } else {
                    (QosOp::Replace, token)
                };
            let name = name.trim();
            (!name.is_empty()).then(|| op(name.to_string()))
        })
        .collect()
}

/// Apply instructions to a QOS list in order. Returns true if it changed.
pub fn apply_qos_delta(list: &mut Vec<String>, ops: &[QosOp]) -> bool {
    let before = list.clone();
    let mut flushed = false;
    for op in ops {
        match op {
            QosOp::Add(name) => push_unique(list, name),
            QosOp::Remove(name) => list.retain(|q| !q.eq_ignore_ascii_case(name)),
            QosOp::Replace(name) => {
                if !flushed {
                    list.clear();
                    flushed = true;
                }
                push_unique(list, name);
            }
        }
    }
    *list != before
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|q| q.eq_ignore_ascii_case(name)) {
        list.push(name.to_string());
    }
}
