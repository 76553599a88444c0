//! Transcript post-processing
//!
//! Upstream models answer with apologies, prompt echoes and hallucinated
//! loops often enough that the cleanup below is a contract of the pipeline,
//! not a cosmetic pass. Steps run in a fixed order; each one feeds the next.

use regex::Regex;
use std::sync::OnceLock;

const SILENCE: &str = "[silence]";
const UNCLEAR: &str = "[unclear]";

/// Window size for the phrase-repetition filter
const PHRASE_WINDOW: usize = 5;

/// Repetitions at which a window is treated as a hallucinated loop
const PHRASE_REPEAT_LIMIT: usize = 4;

fn refusal_preambles() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^i\s+(?:cannot|can't|am unable to|'m unable to)\s+(?:process|transcribe|access|hear)[^\n]*",
            r"(?i)^(?:sure[,!.]?\s+)?here(?:'s| is) (?:the|your|a) transcri(?:ption|pt)[:.]?\s*",
            r"(?i)^as an ai(?: language model)?[^\n]*",
            r"(?i)^i(?:'m| am) sorry,?\s+(?:but\s+)?[^\n]*",
            r"(?i)^unfortunately,?\s+i[^\n]*",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("refusal preamble pattern"))
        .collect()
    })
}

fn speaker_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[Speaker \d+\]:[^\n]*").expect("speaker line pattern"))
}

fn nonverbal_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\[Speaker \d+\]:\s*\[[^\]]+\]\s*$").expect("non-verbal line pattern")
    })
}

fn refusal_marker() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:i cannot|i can't|i am unable|i'm unable|as an ai|i apologi[sz]e)\b")
            .expect("refusal marker pattern")
    })
}

/// Clean a raw transcriber response. `prompt` is the exact prompt sent with
/// the request, used to strip leading echoes.
pub fn clean_transcript(raw: &str, prompt: &str) -> String {
    // 1. Leading prompt echo.
    let text = strip_prompt_echo(raw.trim(), prompt);

    // 2. Refusal preambles.
    let text = strip_refusal_preambles(&text);

    // 3. Refusal body instead of a transcription: salvage any embedded
    // speaker-labelled substring, or give up. A transcript that opens with a
    // speaker label is kept even if someone on tape says "I cannot".
    if refusal_marker().is_match(&text) && !text.trim_start().starts_with("[Speaker") {
        return match speaker_line().find(&text) {
            Some(found) => found.as_str().trim().to_string(),
            None => UNCLEAR.to_string(),
        };
    }

    // 4. Immediately consecutive identical lines.
    let text = dedup_consecutive_lines(&text);

    // 5. Hallucinated phrase loops.
    let text = collapse_phrase_repetition(&text);

    // 6. Nothing but non-verbal annotations.
    let trimmed = text.trim();
    if !trimmed.is_empty() && trimmed.len() < 200 {
        let all_nonverbal = trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .all(|l| nonverbal_line().is_match(l.trim()));
        if all_nonverbal {
            return SILENCE.to_string();
        }
    }

    // 7. Empty result.
    if trimmed.is_empty() {
        return SILENCE.to_string();
    }
    trimmed.to_string()
}

/// Drop leading lines that merely echo the prompt back
fn strip_prompt_echo(text: &str, prompt: &str) -> String {
    if prompt.is_empty() {
        return text.to_string();
    }

    let mut rest = text;
    if let Some(stripped) = rest.strip_prefix(prompt) {
        rest = stripped;
    }

    let mut lines: Vec<&str> = rest.lines().collect();
    while let Some(first) = lines.first() {
        let candidate = first.trim();
        if !candidate.is_empty() && prompt.contains(candidate) {
            lines.remove(0);
        } else {
            break;
        }
    }
    lines.join("\n").trim().to_string()
}

fn strip_refusal_preambles(text: &str) -> String {
    let mut out = text.trim().to_string();
    loop {
        let mut changed = false;
        for pattern in refusal_preambles() {
            if let Some(found) = pattern.find(&out) {
                if found.start() == 0 {
                    out = out[found.end()..].trim_start().to_string();
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    out
}

/// Keep the first of any run of identical lines
fn dedup_consecutive_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut previous: Option<&str> = None;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if previous == Some(trimmed) && !trimmed.trim().is_empty() {
            continue;
        }
        previous = Some(trimmed);
        out.push(trimmed);
    }
    out.join("\n")
}

/// Remove hallucinated loops: any 5-word window repeating at least 4 times
/// keeps only its first instance. Windows are evaluated per line so line
/// structure survives.
fn collapse_phrase_repetition(text: &str) -> String {
    text.lines()
        .map(collapse_phrase_repetition_in_line)
        .collect::<Vec<String>>()
        .join("\n")
}

fn collapse_phrase_repetition_in_line(line: &str) -> String {
    let words: Vec<&str> = line.split_whitespace().collect();
    // Overlapping repeats can hit the limit in far fewer words than
    // window * limit, so only a line too short for a single window is exempt.
    if words.len() < PHRASE_WINDOW {
        return line.to_string();
    }

    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for window in words.windows(PHRASE_WINDOW) {
        *counts.entry(window.join(" ").to_lowercase()).or_default() += 1;
    }
    let offenders: std::collections::HashSet<String> = counts
        .into_iter()
        .filter(|(_, count)| *count >= PHRASE_REPEAT_LIMIT)
        .map(|(key, _)| key)
        .collect();
    if offenders.is_empty() {
        return line.to_string();
    }

    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < words.len() {
        if i + PHRASE_WINDOW <= words.len() {
            let key = words[i..i + PHRASE_WINDOW].join(" ").to_lowercase();
            if offenders.contains(&key) {
                if seen.contains(&key) {
                    i += PHRASE_WINDOW;
                    continue;
                }
                seen.insert(key);
            }
        }
        out.push(words[i]);
        i += 1;
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::{build_prompt, TRANSCRIBE_INSTRUCTION};

    #[test]
    fn test_clean_passes_ordinary_transcript_through() {
        let raw = "[Speaker 1]: Good morning everyone.\n[Speaker 2]: Morning, shall we start?";
        assert_eq!(clean_transcript(raw, TRANSCRIBE_INSTRUCTION), raw);
    }

    #[test]
    fn test_strips_leading_prompt_echo() {
        let prompt = build_prompt(None);
        let raw = format!("{}\n[Speaker 1]: The audit is on track.", prompt);
        assert_eq!(
            clean_transcript(&raw, &prompt),
            "[Speaker 1]: The audit is on track."
        );
    }

    #[test]
    fn test_strips_transcription_preamble() {
        let raw = "Here's the transcription: [Speaker 1]: We agreed on Thursday.";
        assert_eq!(
            clean_transcript(raw, TRANSCRIBE_INSTRUCTION),
            "[Speaker 1]: We agreed on Thursday."
        );
    }

    #[test]
    fn test_refusal_without_speaker_label_becomes_unclear() {
        let raw = "The audio appears to be music. I am unable to transcribe speech from it.";
        assert_eq!(clean_transcript(raw, TRANSCRIBE_INSTRUCTION), "[unclear]");
    }

    #[test]
    fn test_pure_preamble_collapses_to_silence() {
        let raw = "I cannot process audio directly.";
        assert_eq!(clean_transcript(raw, TRANSCRIBE_INSTRUCTION), "[silence]");
    }

    #[test]
    fn test_spoken_refusal_words_are_kept() {
        let raw = "[Speaker 1]: I cannot believe we shipped that.";
        assert_eq!(clean_transcript(raw, TRANSCRIBE_INSTRUCTION), raw);
    }

    #[test]
    fn test_refusal_with_embedded_speaker_line_is_salvaged() {
        let raw = "I apologize, the quality is poor.\nWhat I could hear: [Speaker 1]: move the deadline.";
        assert_eq!(
            clean_transcript(raw, TRANSCRIBE_INSTRUCTION),
            "[Speaker 1]: move the deadline."
        );
    }

    #[test]
    fn test_consecutive_duplicate_lines_are_collapsed() {
        let raw = "[Speaker 1]: Thank you.\n[Speaker 1]: Thank you.\n[Speaker 1]: Thank you.\n[Speaker 2]: You're welcome.";
        assert_eq!(
            clean_transcript(raw, TRANSCRIBE_INSTRUCTION),
            "[Speaker 1]: Thank you.\n[Speaker 2]: You're welcome."
        );
    }

    #[test]
    fn test_phrase_loop_keeps_first_instance() {
        let phrase = "thanks for watching the video";
        let raw = format!("[Speaker 1]: {0} {0} {0} {0} {0}", phrase);
        let cleaned = clean_transcript(&raw, TRANSCRIBE_INSTRUCTION);
        assert_eq!(cleaned.matches(phrase).count(), 1);
        assert!(cleaned.starts_with("[Speaker 1]:"));
    }

    #[test]
    fn test_nonverbal_only_collapses_to_silence() {
        let raw = "[Speaker 1]: [coughing]\n[Speaker 1]: [background noise]";
        assert_eq!(clean_transcript(raw, TRANSCRIBE_INSTRUCTION), "[silence]");
    }

    #[test]
    fn test_long_nonverbal_transcript_is_kept() {
        let line = "[Speaker 1]: [prolonged mechanical noise from the construction site next door]";
        let raw = format!("{}\n{}\n{}\n{}", line, line.replace(" 1]", " 2]"), line.replace(" 1]", " 3]"), line.replace(" 1]", " 4]"));
        // Over the 200-character ceiling the collapse does not apply.
        assert_ne!(clean_transcript(&raw, TRANSCRIBE_INSTRUCTION), "[silence]");
    }

    #[test]
    fn test_empty_result_becomes_silence() {
        assert_eq!(clean_transcript("", TRANSCRIBE_INSTRUCTION), "[silence]");
        assert_eq!(clean_transcript("   \n  ", TRANSCRIBE_INSTRUCTION), "[silence]");
    }

    #[test]
    fn test_short_repetition_survives() {
        // Three repeats are below the loop threshold and must be kept.
        let raw = "[Speaker 1]: no no no that was my point exactly and I will say it again because it matters";
        assert_eq!(clean_transcript(raw, TRANSCRIBE_INSTRUCTION), raw);
    }
}
