//! Derives service dependency links from merged traces.

use crate::model::{DependencyLink, Kind, Span};
use std::collections::BTreeMap;
use tracing::debug;

/// Accumulates links over one or more traces.
///
/// Each trace is arranged into a span tree: the first span without a parent
/// is the root, spans whose parent is missing are attached to the root, and
/// the server half of a shared RPC hangs under its client half. When no root
/// exists every orphan becomes its own root.
#[derive(Debug, Default)]
pub struct DependencyLinker {
    links: BTreeMap<(String, String), (u64, u64)>,
}

impl DependencyLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_trace(&mut self, spans: &[Span]) -> &mut Self {
        if spans.is_empty() {
            return self;
        }
        let parents = build_tree(spans);

        for (index, span) in spans.iter().enumerate() {
            let Some(kind) = span.kind else { continue };
            match kind {
                Kind::Server | Kind::Consumer => {
                    let Some(child) = span.local_service_name() else { continue };
                    let parent = span
                        .remote_service_name()
                        .or_else(|| ancestor_service(spans, &parents, index));
                    match parent {
                        Some(parent) => self.add(parent, child, 1, span.is_error() as u64),
                        None => debug!(span_id = %span.id, "no caller for {:?} span", kind),
                    }
                }
                Kind::Client | Kind::Producer => {
                    let (Some(parent), Some(child)) =
                        (span.local_service_name(), span.remote_service_name())
                    else {
                        continue;
                    };
                    // Messaging always records the hop to the broker.
                    let callee = (kind == Kind::Client)
                        .then(|| {
                            (0..spans.len()).find(|&k| {
                                parents[k] == Some(index) && spans[k].kind == Some(Kind::Server)
                            })
                        })
                        .flatten();
                    match callee {
                        // The callee side records the call; only carry a client-observed error.
                        Some(k) => {
                            if span.is_error() && !spans[k].is_error() {
                                if let Some(callee_service) = spans[k].local_service_name() {
                                    self.add(parent, callee_service, 0, 1);
                                }
                            }
                        }
                        None => self.add(parent, child, 1, span.is_error() as u64),
                    }
                }
            }
        }
        self
    }

    fn add(&mut self, parent: &str, child: &str, calls: u64, errors: u64) {
        let entry = self
            .links
            .entry((parent.to_string(), child.to_string()))
            .or_insert((0, 0));
        entry.0 += calls;
        entry.1 += errors;
    }

    pub fn link(&self) -> Vec<DependencyLink> {
        self.links
            .iter()
            .map(|((parent, child), (calls, errors))| {
                DependencyLink::new(parent.clone(), child.clone(), *calls, *errors)
            })
            .collect()
    }
}

/// Sum-merges links sharing a (parent, child) pair. Output is sorted by key.
pub fn merge_links(links: impl IntoIterator<Item = DependencyLink>) -> Vec<DependencyLink> {
    let mut merged: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
    for link in links {
        let entry = merged.entry((link.parent, link.child)).or_insert((0, 0));
        entry.0 += link.call_count;
        entry.1 += link.error_count;
    }
    merged
        .into_iter()
        .map(|((parent, child), (calls, errors))| DependencyLink::new(parent, child, calls, errors))
        .collect()
}

fn build_tree(spans: &[Span]) -> Vec<Option<usize>> {
    let mut parents: Vec<Option<usize>> = spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            if span.is_shared() {
                if let Some(client) = spans
                    .iter()
                    .position(|s| s.id == span.id && !s.is_shared())
                {
                    return Some(client);
                }
            }
            let parent_id = span.parent_id.as_deref()?;
            let candidates = spans
                .iter()
                .enumerate()
                .filter(|(i, s)| *i != index && s.id == parent_id);
            let mut first = None;
            for (i, s) in candidates {
                // Children of a shared RPC belong under its server half.
                if s.is_shared() {
                    return Some(i);
                }
                first.get_or_insert(i);
            }
            first
        })
        .collect();

    let root = spans
        .iter()
        .enumerate()
        .position(|(i, s)| s.parent_id.is_none() && parents[i].is_none());
    if let Some(root) = root {
        for (i, parent) in parents.iter_mut().enumerate() {
            if i != root && parent.is_none() {
                *parent = Some(root);
            }
        }
    }
    parents
}

fn ancestor_service<'a>(spans: &'a [Span], parents: &[Option<usize>], index: usize) -> Option<&'a str> {
    let mut current = parents[index];
    let mut hops = 0;
    while let Some(i) = current {
        if hops > spans.len() {
            break;
        }
        if let Some(service) = spans[i].local_service_name() {
            return Some(service);
        }
        current = parents[i];
        hops += 1;
    }
    None
}
