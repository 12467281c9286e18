//! Text preparation for speech.
//!
//! Piper reads whatever it is given, including markdown markers, so text is
//! cleaned before synthesis. Long inputs are split at punctuation; each chunk is
//! synthesized on its own and silence is inserted between chunks, which sounds
//! more natural than the model's own phrasing on run-on input.

/// Pause after `.`, `!`, `?`
pub const SENTENCE_PAUSE_MS: u32 = 400;
/// Pause after `;` and `:`
pub const CLAUSE_PAUSE_MS: u32 = 250;
/// Pause after `,`
pub const COMMA_PAUSE_MS: u32 = 150;

const ABBREVIATIONS: &[&str] = &[
    "dr.", "mr.", "mrs.", "ms.", "prof.", "etc.", "vs.", "e.g.", "i.e.", "a.m.", "p.m.", "inc.",
    "ltd.", "corp.", "st.", "no.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Silence to insert after this chunk; zero for the last one
    pub pause_after_ms: u32,
}

/// Strip markdown and normalize whitespace so the text reads naturally.
///
/// Falls back to the trimmed input if cleaning leaves nothing behind.
pub fn normalize_for_speech(text: &str) -> String {
    let without_code = strip_code_fences(text);
    let without_links = unwrap_links(&without_code);

    let lines: Vec<&str> = without_links.lines().map(strip_line_markers).collect();
    let mut cleaned = lines.join(" ");
    for marker in ["**", "__", "~~", "*", "`", "#"] {
        cleaned = cleaned.replace(marker, "");
    }

    let mut cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    for p in [",", ".", "!", "?", ";", ":"] {
        cleaned = cleaned.replace(&format!(" {p}"), p);
    }

    if cleaned.is_empty() {
        text.trim().to_string()
    } else {
        cleaned
    }
}

/// Split text at punctuation followed by whitespace (or the end of input).
///
/// Numbers like `1,000`, `3.14` or `10:30` never split since the punctuation is
/// not followed by whitespace, and known abbreviations do not end a sentence.
pub fn split_into_chunks(text: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if !chars.peek().map_or(true, |next| next.is_whitespace()) {
            continue;
        }
        let pause = match c {
            '.' if ends_with_abbreviation(&current) => continue,
            '.' | '!' | '?' => SENTENCE_PAUSE_MS,
            ';' | ':' => CLAUSE_PAUSE_MS,
            ',' => COMMA_PAUSE_MS,
            _ => continue,
        };
        push_chunk(&mut chunks, &current, pause);
        current.clear();
    }
    push_chunk(&mut chunks, &current, 0);

    match chunks.last_mut() {
        Some(last) => last.pause_after_ms = 0,
        None => chunks.push(Chunk {
            text: text.trim().to_string(),
            pause_after_ms: 0,
        }),
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, text: &str, pause_after_ms: u32) {
    let text = text.trim();
    if !text.is_empty() {
        chunks.push(Chunk {
            text: text.to_string(),
            pause_after_ms,
        });
    }
}

fn ends_with_abbreviation(current: &str) -> bool {
    let word = current.rsplit(char::is_whitespace).next().unwrap_or("");
    let word = word.to_lowercase();
    ABBREVIATIONS.iter().any(|abbr| word == *abbr)
}

fn strip_code_fences(text: &str) -> String {
    let mut out = text.to_string();
    while let Some(start) = out.find("```") {
        match out[start + 3..].find("```") {
            Some(end) => out.replace_range(start..start + 3 + end + 3, " "),
            None => break,
        }
    }
    out
}

/// `[label](url)` becomes `label`.
fn unwrap_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let after_open = &rest[open + 1..];
        let Some(mid) = after_open.find("](") else {
            break;
        };
        let Some(close) = after_open[mid + 2..].find(')') else {
            break;
        };
        out.push_str(&rest[..open]);
        out.push_str(&after_open[..mid]);
        rest = &after_open[mid + 2 + close + 1..];
    }
    out.push_str(rest);
    out
}

/// Drop heading hashes and list bullets at the start of a line.
fn strip_line_markers(line: &str) -> &str {
    let trimmed = line.trim_start().trim_start_matches('#').trim_start();
    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(bullet) {
            return rest;
        }
    }
    if let Some(dot) = trimmed.find(". ") {
        if dot > 0 && trimmed[..dot].chars().all(|c| c.is_ascii_digit()) {
            return &trimmed[dot + 2..];
        }
    }
    trimmed
}
