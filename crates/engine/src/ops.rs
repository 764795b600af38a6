//! Sheet-level undo items and their interpreter over `SheetContent`.

use serde::{Deserialize, Serialize};

use crate::content::{Color, Divider, Line, Plane, SheetContent, TextBlock};
use crate::history::{Applied, HistoryItem, Observation, Replayer, Reversibility};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SheetOp {
    InsertLines { at: usize, lines: Vec<Line> },
    RemoveLines { at: usize, lines: Vec<Line> },
    InsertPlanes { at: usize, planes: Vec<Plane> },
    RemovePlanes { at: usize, planes: Vec<Plane> },
    InsertTexts { at: usize, texts: Vec<TextBlock> },
    RemoveTexts { at: usize, texts: Vec<TextBlock> },
    InsertDraft { at: usize, lines: Vec<Line> },
    RemoveDraft { at: usize, lines: Vec<Line> },
    /// Replace bytes `start..end` of text block `block` with `text`.
    /// `previous` is the replaced slice.
    ReplaceTextRange { block: usize, start: usize, end: usize, text: String, previous: String },
    SetDividers { dividers: Vec<Divider>, previous: Vec<Divider> },
    SetBackground { color: Color, previous: Color },
    TranslateLines { start: usize, end: usize, dx: f32, dy: f32 },
    /// New line `i` is old line `order[i]`.
    ReorderLines { order: Vec<usize> },
    /// Wholesale replacement from an external geometry operation.
    ReplaceContent { content: Box<SheetContent> },
}

impl HistoryItem for SheetOp {
    fn reversibility(&self) -> Reversibility {
        match self {
            SheetOp::TranslateLines { .. } | SheetOp::ReorderLines { .. } => Reversibility::Lazy,
            SheetOp::ReplaceContent { .. } => Reversibility::Unreversible,
            _ => Reversibility::Reversible,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SheetOp::InsertLines { .. } => "insert-lines",
            SheetOp::RemoveLines { .. } => "remove-lines",
            SheetOp::InsertPlanes { .. } => "insert-planes",
            SheetOp::RemovePlanes { .. } => "remove-planes",
            SheetOp::InsertTexts { .. } => "insert-texts",
            SheetOp::RemoveTexts { .. } => "remove-texts",
            SheetOp::InsertDraft { .. } => "insert-draft",
            SheetOp::RemoveDraft { .. } => "remove-draft",
            SheetOp::ReplaceTextRange { .. } => "replace-text-range",
            SheetOp::SetDividers { .. } => "set-dividers",
            SheetOp::SetBackground { .. } => "set-background",
            SheetOp::TranslateLines { .. } => "translate-lines",
            SheetOp::ReorderLines { .. } => "reorder-lines",
            SheetOp::ReplaceContent { .. } => "replace-content",
        }
    }
}

impl SheetOp {
    /// Inverse of a reversible item, derived from the item alone.
    pub fn inverse(&self) -> Option<SheetOp> {
        Some(match self {
            SheetOp::InsertLines { at, lines } => SheetOp::RemoveLines { at: *at, lines: lines.clone() },
            SheetOp::RemoveLines { at, lines } => SheetOp::InsertLines { at: *at, lines: lines.clone() },
            SheetOp::InsertPlanes { at, planes } => SheetOp::RemovePlanes { at: *at, planes: planes.clone() },
            SheetOp::RemovePlanes { at, planes } => SheetOp::InsertPlanes { at: *at, planes: planes.clone() },
            SheetOp::InsertTexts { at, texts } => SheetOp::RemoveTexts { at: *at, texts: texts.clone() },
            SheetOp::RemoveTexts { at, texts } => SheetOp::InsertTexts { at: *at, texts: texts.clone() },
            SheetOp::InsertDraft { at, lines } => SheetOp::RemoveDraft { at: *at, lines: lines.clone() },
            SheetOp::RemoveDraft { at, lines } => SheetOp::InsertDraft { at: *at, lines: lines.clone() },
            SheetOp::ReplaceTextRange { block, start, text, previous, .. } => SheetOp::ReplaceTextRange {
                block: *block,
                start: *start,
                end: start + text.len(),
                text: previous.clone(),
                previous: text.clone(),
            },
            SheetOp::SetDividers { dividers, previous } => SheetOp::SetDividers {
                dividers: previous.clone(),
                previous: dividers.clone(),
            },
            SheetOp::SetBackground { color, previous } => SheetOp::SetBackground {
                color: *previous,
                previous: *color,
            },
            SheetOp::TranslateLines { .. } | SheetOp::ReorderLines { .. } | SheetOp::ReplaceContent { .. } => {
                return None
            }
        })
    }

    /// Undo side to record for this item, given content as it was *before*
    /// the item was applied. `None` for lazily-reversible items.
    pub fn undo_for(&self, before: &SheetContent) -> Option<SheetOp> {
        match self.reversibility() {
            Reversibility::Reversible => self.inverse(),
            Reversibility::Lazy => None,
            Reversibility::Unreversible => Some(SheetOp::ReplaceContent { content: Box::new(before.clone()) }),
        }
    }
}

fn insert_items<T: Clone>(list: &mut Vec<T>, at: usize, items: &[T]) -> Option<usize> {
    let idx = at.min(list.len());
    let tail = list.split_off(idx);
    list.extend_from_slice(items);
    list.extend(tail);
    (idx != at).then_some(idx)
}

enum Removal<T> {
    Exact,
    Clamped(usize, Vec<T>),
    TooShort,
}

fn remove_items<T: Clone + PartialEq>(list: &mut Vec<T>, at: usize, expected: &[T]) -> Removal<T> {
    let n = expected.len();
    if n > list.len() {
        return Removal::TooShort;
    }
    let idx = at.min(list.len() - n);
    let removed: Vec<T> = list.drain(idx..idx + n).collect();
    if idx == at && removed == expected {
        Removal::Exact
    } else {
        Removal::Clamped(idx, removed)
    }
}

fn observe_insert(len: usize, at: usize) -> Option<usize> {
    (at > len).then_some(len)
}

fn observe_remove<T: Clone + PartialEq>(list: &[T], at: usize, expected: &[T]) -> Result<Option<(usize, Vec<T>)>, String> {
    let n = expected.len();
    if n > list.len() {
        return Err(format!("content too short: need {n}, have {}", list.len()));
    }
    let idx = at.min(list.len() - n);
    let slice = &list[idx..idx + n];
    if idx == at && slice == expected {
        Ok(None)
    } else {
        Ok(Some((idx, slice.to_vec())))
    }
}

/// Clamp a byte range into `text`, rejecting ranges that split a character.
fn clamp_text_range(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let end = end.min(text.len());
    let start = start.min(end);
    (text.is_char_boundary(start) && text.is_char_boundary(end)).then_some((start, end))
}

macro_rules! insert_remove {
    ($list:expr, $op:ident, $at:expr, $items:expr, $field:ident, insert) => {{
        match insert_items(&mut $list, *$at, $items) {
            None => Applied::Exact,
            Some(at) => Applied::Clamped(SheetOp::$op { at, $field: $items.clone() }),
        }
    }};
    ($list:expr, $op:ident, $at:expr, $items:expr, $field:ident, remove) => {{
        match remove_items(&mut $list, *$at, $items) {
            Removal::Exact => Applied::Exact,
            Removal::Clamped(at, actual) => Applied::Clamped(SheetOp::$op { at, $field: actual }),
            Removal::TooShort => Applied::Failed(format!("content too short for {}", stringify!($op))),
        }
    }};
}

macro_rules! observe_pair {
    ($list:expr, $op:ident, $at:expr, $items:expr, $field:ident, insert) => {{
        match observe_insert($list.len(), *$at) {
            None => Observation::Matches,
            Some(at) => Observation::Drifted(SheetOp::$op { at, $field: $items.clone() }),
        }
    }};
    ($list:expr, $op:ident, $at:expr, $items:expr, $field:ident, remove) => {{
        match observe_remove(&$list, *$at, $items) {
            Ok(None) => Observation::Matches,
            Ok(Some((at, actual))) => Observation::Drifted(SheetOp::$op { at, $field: actual }),
            Err(reason) => Observation::Unrecoverable(reason),
        }
    }};
}

impl Replayer<SheetOp> for SheetContent {
    fn set(&mut self, item: &SheetOp) -> Applied<SheetOp> {
        match item {
            SheetOp::InsertLines { at, lines } => insert_remove!(self.lines, InsertLines, at, lines, lines, insert),
            SheetOp::RemoveLines { at, lines } => insert_remove!(self.lines, RemoveLines, at, lines, lines, remove),
            SheetOp::InsertPlanes { at, planes } => insert_remove!(self.planes, InsertPlanes, at, planes, planes, insert),
            SheetOp::RemovePlanes { at, planes } => insert_remove!(self.planes, RemovePlanes, at, planes, planes, remove),
            SheetOp::InsertTexts { at, texts } => insert_remove!(self.texts, InsertTexts, at, texts, texts, insert),
            SheetOp::RemoveTexts { at, texts } => insert_remove!(self.texts, RemoveTexts, at, texts, texts, remove),
            SheetOp::InsertDraft { at, lines } => insert_remove!(self.draft, InsertDraft, at, lines, lines, insert),
            SheetOp::RemoveDraft { at, lines } => insert_remove!(self.draft, RemoveDraft, at, lines, lines, remove),
            SheetOp::ReplaceTextRange { block, start, end, text, previous } => {
                let Some(target) = self.texts.get_mut(*block) else {
                    return Applied::Failed(format!("text block {block} does not exist"));
                };
                let Some((s, e)) = clamp_text_range(&target.text, *start, *end) else {
                    return Applied::Failed("text range splits a character".into());
                };
                let actual = target.text[s..e].to_string();
                target.text.replace_range(s..e, text);
                if s == *start && e == *end && actual == *previous {
                    Applied::Exact
                } else {
                    Applied::Clamped(SheetOp::ReplaceTextRange {
                        block: *block,
                        start: s,
                        end: e,
                        text: text.clone(),
                        previous: actual,
                    })
                }
            }
            SheetOp::SetDividers { dividers, previous } => {
                let actual = std::mem::replace(&mut self.dividers, dividers.clone());
                if actual == *previous {
                    Applied::Exact
                } else {
                    Applied::Clamped(SheetOp::SetDividers { dividers: dividers.clone(), previous: actual })
                }
            }
            SheetOp::SetBackground { color, previous } => {
                let actual = std::mem::replace(&mut self.background, *color);
                if actual == *previous {
                    Applied::Exact
                } else {
                    Applied::Clamped(SheetOp::SetBackground { color: *color, previous: actual })
                }
            }
            SheetOp::TranslateLines { start, end, dx, dy } => {
                let e = (*end).min(self.lines.len());
                let s = (*start).min(e);
                for line in &mut self.lines[s..e] {
                    line.translate(*dx, *dy);
                }
                if s == *start && e == *end {
                    Applied::Exact
                } else {
                    Applied::Clamped(SheetOp::TranslateLines { start: s, end: e, dx: *dx, dy: *dy })
                }
            }
            SheetOp::ReorderLines { order } => {
                if !is_permutation(order, self.lines.len()) {
                    return Applied::Failed(format!(
                        "reorder of {} lines against {} present",
                        order.len(),
                        self.lines.len()
                    ));
                }
                let old = std::mem::take(&mut self.lines);
                self.lines = order.iter().map(|i| old[*i].clone()).collect();
                Applied::Exact
            }
            SheetOp::ReplaceContent { content } => {
                *self = (**content).clone();
                Applied::Exact
            }
        }
    }

    fn invert(&self, item: &SheetOp) -> Option<SheetOp> {
        match item {
            SheetOp::TranslateLines { start, end, dx, dy } => {
                let e = (*end).min(self.lines.len());
                Some(SheetOp::TranslateLines { start: (*start).min(e), end: e, dx: -dx, dy: -dy })
            }
            SheetOp::ReorderLines { order } => {
                if !is_permutation(order, self.lines.len()) {
                    return None;
                }
                let mut inverse = vec![0; order.len()];
                for (i, o) in order.iter().enumerate() {
                    inverse[*o] = i;
                }
                Some(SheetOp::ReorderLines { order: inverse })
            }
            other => other.inverse(),
        }
    }

    fn observe(&self, pending: &SheetOp) -> Observation<SheetOp> {
        match pending {
            SheetOp::InsertLines { at, lines } => observe_pair!(self.lines, InsertLines, at, lines, lines, insert),
            SheetOp::RemoveLines { at, lines } => observe_pair!(self.lines, RemoveLines, at, lines, lines, remove),
            SheetOp::InsertPlanes { at, planes } => observe_pair!(self.planes, InsertPlanes, at, planes, planes, insert),
            SheetOp::RemovePlanes { at, planes } => observe_pair!(self.planes, RemovePlanes, at, planes, planes, remove),
            SheetOp::InsertTexts { at, texts } => observe_pair!(self.texts, InsertTexts, at, texts, texts, insert),
            SheetOp::RemoveTexts { at, texts } => observe_pair!(self.texts, RemoveTexts, at, texts, texts, remove),
            SheetOp::InsertDraft { at, lines } => observe_pair!(self.draft, InsertDraft, at, lines, lines, insert),
            SheetOp::RemoveDraft { at, lines } => observe_pair!(self.draft, RemoveDraft, at, lines, lines, remove),
            SheetOp::ReplaceTextRange { block, start, end, text, previous } => {
                let Some(target) = self.texts.get(*block) else {
                    return Observation::Unrecoverable(format!("text block {block} does not exist"));
                };
                match clamp_text_range(&target.text, *start, *end) {
                    Some((s, e)) if s == *start && e == *end && target.text[s..e] == **previous => Observation::Matches,
                    Some((s, e)) => Observation::Drifted(SheetOp::ReplaceTextRange {
                        block: *block,
                        start: s,
                        end: e,
                        text: text.clone(),
                        previous: target.text[s..e].to_string(),
                    }),
                    None => Observation::Unrecoverable("text range splits a character".into()),
                }
            }
            SheetOp::SetDividers { dividers, previous } => {
                if self.dividers == *previous {
                    Observation::Matches
                } else {
                    Observation::Drifted(SheetOp::SetDividers { dividers: dividers.clone(), previous: self.dividers.clone() })
                }
            }
            SheetOp::SetBackground { color, previous } => {
                if self.background == *previous {
                    Observation::Matches
                } else {
                    Observation::Drifted(SheetOp::SetBackground { color: *color, previous: self.background })
                }
            }
            SheetOp::TranslateLines { start, end, dx, dy } => {
                if *start <= *end && *end <= self.lines.len() {
                    Observation::Matches
                } else {
                    let e = (*end).min(self.lines.len());
                    Observation::Drifted(SheetOp::TranslateLines { start: (*start).min(e), end: e, dx: *dx, dy: *dy })
                }
            }
            SheetOp::ReorderLines { order } => {
                if is_permutation(order, self.lines.len()) {
                    Observation::Matches
                } else {
                    Observation::Unrecoverable("line count changed under reorder".into())
                }
            }
            SheetOp::ReplaceContent { .. } => Observation::Matches,
        }
    }
}

fn is_permutation(order: &[usize], len: usize) -> bool {
    if order.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &i in order {
        if i >= len || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}
