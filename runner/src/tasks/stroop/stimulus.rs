//! Balanced Stroop stimulus generation.
//!
//! The canonical block is 60 stimuli: every ink colour crossed with every
//! colour word five times (45 colour-word trials) plus 15 nonsense words whose
//! ink rotates through the three colours. Sequences are shuffled with
//! Fisher-Yates and then repaired so no stimulus immediately repeats.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::i18n::Language;

pub const REPEATS_PER_COMBINATION: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Color {
    Red,
    Green,
    Blue,
}

impl Color {
    pub const ALL: [Color; 3] = [Color::Red, Color::Green, Color::Blue];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Answer {
    Red,
    Green,
    Blue,
    Other,
}

impl From<Color> for Answer {
    fn from(color: Color) -> Self {
        match color {
            Color::Red => Answer::Red,
            Color::Green => Answer::Green,
            Color::Blue => Answer::Blue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    ColorWord,
    Nonsense,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stimulus {
    pub word: String,
    pub ink_color: Color,
    pub correct_answer: Answer,
    pub is_congruent: bool,
    pub category: Category,
}

impl Stimulus {
    fn color_word(word_color: Color, ink_color: Color, language: Language) -> Self {
        Self {
            word: color_word(word_color, language).to_string(),
            ink_color,
            correct_answer: ink_color.into(),
            is_congruent: word_color == ink_color,
            category: Category::ColorWord,
        }
    }

    fn nonsense(word: &str, ink_color: Color) -> Self {
        Self {
            word: word.to_string(),
            ink_color,
            correct_answer: Answer::Other,
            is_congruent: false,
            category: Category::Nonsense,
        }
    }

    /// Identity used by the repeat check: word, ink, answer and category.
    pub fn same_as(&self, other: &Stimulus) -> bool {
        self.word == other.word
            && self.ink_color == other.ink_color
            && self.correct_answer == other.correct_answer
            && self.category == other.category
    }
}

fn color_word(color: Color, language: Language) -> &'static str {
    match (language, color) {
        (Language::En, Color::Red) => "RED",
        (Language::En, Color::Green) => "GREEN",
        (Language::En, Color::Blue) => "BLUE",
        (Language::Ja, Color::Red) => "赤",
        (Language::Ja, Color::Green) => "緑",
        (Language::Ja, Color::Blue) => "青",
    }
}

const NONSENSE_EN: [&str; 15] = [
    "BLORP", "TANE", "MUFT", "SPRAV", "KELM", "DOOP", "VRIN", "NALK", "FOSH", "PLEN", "ZORT",
    "WIBS", "GLAF", "TREP", "MOLK",
];

const NONSENSE_JA: [&str; 15] = [
    "ヌモ", "ケサラ", "ロネ", "チヨン", "フミロ", "ソタ", "ミケヌ", "ホロメ", "ヤセニ", "ニタ",
    "ムソ", "レキ", "ハヌ", "ゾロメ", "テキヌ",
];

fn nonsense_words(language: Language) -> &'static [&'static str; 15] {
    match language {
        Language::En => &NONSENSE_EN,
        Language::Ja => &NONSENSE_JA,
    }
}

/// The unshuffled canonical block.
pub fn base_set(language: Language) -> Vec<Stimulus> {
    let mut set = Vec::with_capacity(canonical_block_size());
    for ink in Color::ALL {
        for word in Color::ALL {
            for _ in 0..REPEATS_PER_COMBINATION {
                set.push(Stimulus::color_word(word, ink, language));
            }
        }
    }
    for (index, word) in nonsense_words(language).iter().enumerate() {
        set.push(Stimulus::nonsense(word, Color::ALL[index % Color::ALL.len()]));
    }
    set
}

pub fn canonical_block_size() -> usize {
    Color::ALL.len() * Color::ALL.len() * REPEATS_PER_COMBINATION + NONSENSE_EN.len()
}

/// Produce `target_count` stimuli for one block.
pub fn generate<R: Rng + ?Sized>(
    target_count: usize,
    language: Language,
    rng: &mut R,
) -> Vec<Stimulus> {
    if target_count == 0 {
        return Vec::new();
    }

    let base = base_set(language);
    let shuffled_copy = |rng: &mut R| {
        let mut copy = base.clone();
        copy.shuffle(rng);
        copy
    };

    let mut sequence = if target_count == base.len() {
        shuffled_copy(&mut *rng)
    } else if target_count > base.len() {
        let mut sequence = Vec::with_capacity(target_count);
        for _ in 0..target_count / base.len() {
            sequence.extend(shuffled_copy(&mut *rng));
        }
        let remainder = target_count % base.len();
        if remainder > 0 {
            let mut extra = shuffled_copy(&mut *rng);
            extra.truncate(remainder);
            sequence.extend(extra);
        }
        sequence
    } else {
        // Repair the whole copy first: any window of a repeat-free sequence is
        // repeat-free, which a short slice could not guarantee on its own.
        let mut copy = shuffled_copy(&mut *rng);
        avoid_immediate_repeats(&mut copy);
        copy.truncate(target_count);
        copy
    };

    avoid_immediate_repeats(&mut sequence);
    sequence
}

/// Swap away every stimulus identical to its predecessor, preferring a later
/// position and falling back to an earlier one.
pub fn avoid_immediate_repeats(items: &mut [Stimulus]) {
    for index in 1..items.len() {
        if !items[index].same_as(&items[index - 1]) {
            continue;
        }

        let forward = (index + 1..items.len()).find(|&other| swap_is_safe(items, index, other));
        let target = forward
            .or_else(|| (0..index).rev().find(|&other| swap_is_safe(items, index, other)));

        match target {
            Some(other) => items.swap(index, other),
            None => tracing::debug!(index, "no safe swap position for repeated stimulus"),
        }
    }
}

fn swap_is_safe(items: &[Stimulus], a: usize, b: usize) -> bool {
    if items[a].same_as(&items[b]) {
        return false;
    }

    let len = items.len();
    [a, b].into_iter().all(|position| {
        let here = after_swap(items, a, b, position);
        let clashes_before = position > 0 && here.same_as(after_swap(items, a, b, position - 1));
        let clashes_after =
            position + 1 < len && here.same_as(after_swap(items, a, b, position + 1));
        !clashes_before && !clashes_after
    })
}

fn after_swap(items: &[Stimulus], a: usize, b: usize, position: usize) -> &Stimulus {
    if position == a {
        &items[b]
    } else if position == b {
        &items[a]
    } else {
        &items[position]
    }
}
