//! Topological sequencer
//!
//! Orders items so that each one comes after everything it depends on.
//! Independent items keep their input order. Dependencies on keys that
//! are not part of the batch are ignored.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;

use crate::core::{Transaction, Txid};

/// The dependency graph contains a cycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Dependency cycle through {0}")]
pub struct CycleError(pub String);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Sort `items` so that every item follows the items it depends on
///
/// `key` identifies an item; `depends_on` lists the keys that must precede it.
pub fn topological_sort<T, K, FK, FD>(
    items: Vec<T>,
    key: FK,
    depends_on: FD,
) -> Result<Vec<T>, CycleError>
where
    K: Eq + Hash + Debug,
    FK: Fn(&T) -> K,
    FD: Fn(&T) -> Vec<K>,
{
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        positions.entry(key(item)).or_insert(position);
    }
    let edges: Vec<Vec<usize>> = items
        .iter()
        .enumerate()
        .map(|(position, item)| {
            depends_on(item)
                .iter()
                .filter_map(|dep| positions.get(dep).copied())
                .filter(|dep| *dep != position)
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; items.len()];
    let mut order = Vec::with_capacity(items.len());
    // Iterative DFS: (node, next edge to follow)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..items.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::Visiting;
        stack.push((root, 0));

        while let Some((node, cursor)) = stack.last_mut() {
            let node = *node;
            match edges[node].get(*cursor) {
                Some(&dep) => {
                    *cursor += 1;
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::Visiting;
                            stack.push((dep, 0));
                        }
                        Mark::Visiting => {
                            let culprit = format!("{:?}", key(&items[dep]));
                            log::warn!("Topological sort found a cycle through {}", culprit);
                            return Err(CycleError(culprit));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect())
}

/// Order transactions so parents precede the children spending them
pub fn sort_transactions(transactions: Vec<Transaction>) -> Result<Vec<Transaction>, CycleError> {
    fn itself(tx: &Transaction) -> &Transaction {
        tx
    }
    sort_by_spends(transactions, itself)
}

/// Order anything that wraps a transaction by its spend graph
pub fn sort_by_spends<T, F>(items: Vec<T>, transaction: F) -> Result<Vec<T>, CycleError>
where
    F: Fn(&T) -> &Transaction,
{
    let txids: Vec<Txid> = items.iter().map(|item| transaction(item).txid()).collect();
    let keyed: Vec<(Txid, T)> = txids.into_iter().zip(items).collect();
    let sorted = topological_sort(
        keyed,
        |(txid, _)| *txid,
        |(_, item)| {
            transaction(item)
                .inputs
                .iter()
                .map(|input| input.previous_output.txid)
                .collect()
        },
    )?;
    Ok(sorted.into_iter().map(|(_, item)| item).collect())
}
