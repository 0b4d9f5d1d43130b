/// Tokens that end in a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "vs", "e.g", "i.e", "etc", "jr", "sr",
    "no",
];

/// Default character budget for [`assemble_context`].
pub const DEFAULT_CONTEXT_CHARS: usize = 4000;

/// Number of whitespace-separated words in `text`.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Collapse every run of whitespace into a single space, drop control
/// characters and trim both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `text` into sentences.
///
/// Newlines are treated as spaces and a space is inserted after `.`, `!` or
/// `?` when an uppercase letter follows immediately. A word ending in one of
/// those marks closes the sentence unless it is a known abbreviation (`Dr.`,
/// `e.g.`, `etc.`, ...) or a word longer than one character that starts with
/// a lowercase letter and ends in `.`, which is treated as an unrecognised
/// abbreviation.
///
/// ```
/// use docrag::text_util::split_into_sentences;
///
/// let sentences = split_into_sentences("Dr. Smith met Mr. Jones. They left!");
/// assert_eq!(sentences, vec!["Dr. Smith met Mr. Jones.", "They left!"]);
/// ```
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let spaced = space_after_terminators(text);

    let mut sentences = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for word in spaced.split_whitespace() {
        current.push(word);
        if ends_sentence(word) {
            sentences.push(current.join(" "));
            current.clear();
        }
    }

    if !current.is_empty() {
        sentences.push(current.join(" "));
    }

    sentences
}

fn space_after_terminators(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' => out.push(' '),
            '\r' => {}
            '.' | '!' | '?' => {
                out.push(c);
                if chars.peek().is_some_and(|next| next.is_uppercase()) {
                    out.push(' ');
                }
            }
            _ => out.push(c),
        }
    }

    out
}

fn ends_sentence(word: &str) -> bool {
    let Some(last) = word.chars().last() else {
        return false;
    };
    if !matches!(last, '.' | '!' | '?') {
        return false;
    }

    let lower = word.to_lowercase();
    let stem = lower.trim_end_matches('.');
    if ABBREVIATIONS.contains(&stem) || ABBREVIATIONS.contains(&lower.as_str())
    {
        return false;
    }

    let starts_lowercase = word.chars().next().is_some_and(char::is_lowercase);
    !(last == '.' && starts_lowercase && word.chars().count() > 1)
}

/// Cut `text` to at most `max_chars` characters, preferring a word boundary
/// and appending `ellipsis` when anything was removed.
pub fn truncate_text(text: &str, max_chars: usize, ellipsis: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let ellipsis_len = ellipsis.chars().count();
    if ellipsis_len >= max_chars {
        return ellipsis.chars().take(max_chars).collect();
    }

    let head: String = text.chars().take(max_chars - ellipsis_len).collect();
    let head = match head.rfind(' ') {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head.as_str(),
    };

    format!("{head}{ellipsis}")
}

/// Join retrieved passages into a single context block, each introduced by
/// a `--- <source> ---` header, stopping before `max_chars` is exceeded.
///
/// The first passage is always included, truncated if needed.
pub fn assemble_context<'a, I>(passages: I, max_chars: usize) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut context = String::new();

    for (source, text) in passages {
        let section = format!("--- {source} ---\n{}\n\n", text.trim());
        let used = context.chars().count();
        let needed = section.chars().count();

        if used + needed > max_chars {
            if context.is_empty() {
                context = truncate_text(&section, max_chars, "...");
            }
            break;
        }
        context.push_str(&section);
    }

    context.trim_end().to_string()
}
