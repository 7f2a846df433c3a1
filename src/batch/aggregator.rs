//! Greedy similarity grouping.

use super::types::{next_batch_id, BatchGroup, PendingRequest};
use crate::similarity::{jaccard, tokenize};
use chrono::Utc;
use std::collections::HashSet;

pub const BATCH_PROMPT_HEADER: &str =
    "Please answer the following related questions efficiently:\n\n";
pub const BATCH_PROMPT_FOOTER: &str = "\nProvide concise, accurate answers for each question.";
pub const SHARED_CONTEXT_HEADER: &str = "Shared Context:\n";
/// Contexts beyond this many are dropped from the combined context.
pub const MAX_COMBINED_CONTEXTS: usize = 3;
/// Token allowance for the numbering and instructions of a merged prompt.
pub const BATCH_TOKEN_OVERHEAD: u64 = 200;

/// Clusters `requests` in a single greedy pass.
///
/// Each unclaimed request, in submission order, seeds a group; later
/// unclaimed requests whose similarity to the seed is at least `threshold`
/// join it until it holds `max_group_size` members. Not globally optimal.
/// Ownership of every request moves into exactly one group.
pub fn group(
    requests: Vec<PendingRequest>,
    max_group_size: usize,
    threshold: f64,
) -> Vec<BatchGroup> {
    let max_group_size = max_group_size.max(1);
    let tokens: Vec<HashSet<String>> = requests.iter().map(|r| tokenize(&r.prompt)).collect();
    let mut slots: Vec<Option<PendingRequest>> = requests.into_iter().map(Some).collect();
    let mut groups = Vec::new();

    for seed in 0..slots.len() {
        let Some(seed_request) = slots[seed].take() else {
            continue;
        };
        let mut members = vec![seed_request];
        for other in seed + 1..slots.len() {
            if members.len() >= max_group_size {
                break;
            }
            if slots[other].is_some() && jaccard(&tokens[seed], &tokens[other]) >= threshold {
                if let Some(r) = slots[other].take() {
                    members.push(r);
                }
            }
        }
        groups.push(build_group(members));
    }
    groups
}

fn build_group(members: Vec<PendingRequest>) -> BatchGroup {
    let priority = members.iter().map(|m| m.priority).max().unwrap_or_default();
    let (representative_prompt, combined_context, estimated_tokens) = match members.as_slice() {
        [only] => (
            only.prompt.clone(),
            only.context.clone().unwrap_or_default(),
            u64::from(only.max_tokens),
        ),
        _ => (
            combined_prompt(&members),
            combined_context(&members),
            members.iter().map(|m| u64::from(m.max_tokens)).sum::<u64>() + BATCH_TOKEN_OVERHEAD,
        ),
    };
    BatchGroup {
        id: next_batch_id(),
        members,
        representative_prompt,
        combined_context,
        estimated_tokens,
        priority,
        created_at: Utc::now(),
    }
}

/// Numbered list of member prompts wrapped in batch instructions.
pub fn combined_prompt(members: &[PendingRequest]) -> String {
    let mut prompt = String::from(BATCH_PROMPT_HEADER);
    for (i, m) in members.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, m.prompt));
    }
    prompt.push_str(BATCH_PROMPT_FOOTER);
    prompt
}

/// Up to [`MAX_COMBINED_CONTEXTS`] distinct non-empty contexts, in member order.
pub fn combined_context(members: &[PendingRequest]) -> String {
    let mut seen = HashSet::new();
    let contexts: Vec<&str> = members
        .iter()
        .filter_map(|m| m.context.as_deref())
        .filter(|c| !c.is_empty() && seen.insert(*c))
        .take(MAX_COMBINED_CONTEXTS)
        .collect();
    if contexts.is_empty() {
        String::new()
    } else {
        format!("{}{}", SHARED_CONTEXT_HEADER, contexts.join("\n"))
    }
}
