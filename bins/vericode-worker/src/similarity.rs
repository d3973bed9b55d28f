/// Similarity Engine - Structural Plagiarism Detection
///
/// **Core Responsibility:**
/// Compare a submission against prior submissions of the same assignment
/// using a fingerprint of its syntax tree.
///
/// **Fingerprint:**
/// - The module body parsed by `rustpython-parser`, pretty-printed with
///   `Debug` so every node field sits on its own line
/// - Source offset lines are dropped, so comments, blank lines and spacing
///   do not change it
/// - Identifier names and literals are kept verbatim
/// - Unparsable source has an empty fingerprint and never matches anything
///
/// **Score:**
/// `2·M / (|a| + |b|)` over fingerprint lines, M being the length of an
/// optimal alignment. Symmetric, deterministic, within [0, 1].
///
/// Every comparison runs under a deadline. Past it the diff falls back to
/// a coarser alignment, which can only lower the score.

use rustpython_parser::{ast, Parse};
use similar::{Algorithm, TextDiff};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vericode_common::types::{CorpusEntry, PlagiarismVerdict, SimilarityMatch};

/// A pair is a match only when its score is strictly above this
pub const PLAGIARISM_THRESHOLD: f64 = 0.8;

/// Time allowed for aligning one pair of fingerprints
pub const COMPARISON_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for scoring a submission against the whole corpus
pub const SCAN_BUDGET: Duration = Duration::from_secs(10);

const SOURCE_PATH: &str = "<submission>";
const RANGE_FIELD: &str = "range: ";

/// Structural fingerprint of `source`, empty when it does not parse
pub fn fingerprint(source: &str) -> String {
    match ast::Suite::parse(source, SOURCE_PATH) {
        Ok(suite) => strip_ranges(&format!("{:#?}", suite)),
        Err(e) => {
            debug!(error = %e, "Source does not parse, empty fingerprint");
            String::new()
        }
    }
}

/// `range: 12..30,` as printed for a node location
fn is_range_line(line: &str) -> bool {
    let Some(span) = line.strip_prefix(RANGE_FIELD) else {
        return false;
    };
    let span = span.strip_suffix(',').unwrap_or(span);
    match span.split_once("..") {
        Some((start, end)) => {
            !start.is_empty()
                && !end.is_empty()
                && start.bytes().all(|b| b.is_ascii_digit())
                && end.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Drop node locations from a pretty debug rendering and trim indentation.
/// String literals print quoted and escaped on their own line, so they can
/// never look like a location field.
fn strip_ranges(rendered: &str) -> String {
    rendered
        .lines()
        .map(str::trim)
        .filter(|line| !is_range_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Similarity of two fingerprints in [0, 1]
pub fn similarity(a: &str, b: &str) -> f64 {
    similarity_until(a, b, Instant::now() + COMPARISON_TIMEOUT)
}

fn similarity_until(a: &str, b: &str, deadline: Instant) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .deadline(deadline)
        .diff_lines(a, b);
    f64::from(diff.ratio()).clamp(0.0, 1.0)
}

pub fn is_match(score: f64) -> bool {
    score > PLAGIARISM_THRESHOLD
}

/// Score `source` against every corpus entry.
///
/// Matches are ordered by descending score, ties broken by author id.
/// `max_score` is the highest matching score, 0 when nothing matches.
pub fn detect(source: &str, corpus: &[CorpusEntry]) -> PlagiarismVerdict {
    let current = fingerprint(source);
    if current.is_empty() || corpus.is_empty() {
        return PlagiarismVerdict::default();
    }

    let scan_deadline = Instant::now() + SCAN_BUDGET;
    let mut max_score: f64 = 0.0;
    let mut matches = Vec::new();

    for entry in corpus {
        let deadline = (Instant::now() + COMPARISON_TIMEOUT).min(scan_deadline);
        let score = similarity_until(&current, &fingerprint(&entry.source), deadline);
        if is_match(score) {
            max_score = max_score.max(score);
            matches.push(SimilarityMatch {
                author_id: entry.author_id.clone(),
                score,
            });
        }
    }

    if Instant::now() > scan_deadline {
        warn!(
            corpus_size = corpus.len(),
            budget_ms = SCAN_BUDGET.as_millis() as u64,
            "Similarity scan ran past its budget, later scores are approximate"
        );
    }

    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.author_id.cmp(&b.author_id))
    });

    debug!(
        corpus_size = corpus.len(),
        matches = matches.len(),
        max_score,
        "Similarity scan complete"
    );

    PlagiarismVerdict {
        flagged: !matches.is_empty(),
        max_score,
        matches,
    }
}
