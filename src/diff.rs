/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Sorted-merge diff between two snapshots of observable items.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp<'a, T> {
    /// Present only in the new snapshot.
    Insertion(&'a T),
    /// Present only in the old snapshot.
    Deletion(&'a T),
    /// Same identity on both sides, different value.
    Change { old: &'a T, new: &'a T },
}

/// Merges two sequences sorted by `identity` in O(|old| + |new|). Items
/// equal by identity but unequal by value are emitted as changes.
pub fn diff_sorted<'a, T, C>(old: &'a [T], new: &'a [T], identity: C) -> Vec<DiffOp<'a, T>>
where
    T: PartialEq,
    C: Fn(&T, &T) -> Ordering,
{
    let mut result = vec![];
    let mut i = 0;
    let mut j = 0;
    while i < old.len() && j < new.len() {
        match identity(&old[i], &new[j]) {
            Ordering::Less => {
                result.push(DiffOp::Deletion(&old[i]));
                i += 1;
            }
            Ordering::Greater => {
                result.push(DiffOp::Insertion(&new[j]));
                j += 1;
            }
            Ordering::Equal => {
                if old[i] != new[j] {
                    result.push(DiffOp::Change {
                        old: &old[i],
                        new: &new[j],
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }
    for item in &old[i..] {
        result.push(DiffOp::Deletion(item));
    }
    for item in &new[j..] {
        result.push(DiffOp::Insertion(item));
    }
    result
}
