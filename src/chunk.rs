//! Boundary-preserving text chunker.
//!
//! Splits extracted document text into chunks that respect a configurable
//! `max_chunk_size` (counted in characters, so CJK text is budgeted the
//! same as Latin). Splitting is greedy with a three-tier fallback:
//! paragraphs on blank-line boundaries, then sentences on CJK/Latin
//! terminators, then whitespace-delimited words. No unit smaller than a
//! word is ever cut; a single word longer than the budget is emitted as
//! its own oversized chunk.
//!
//! Pure and stateless. Identical input and budget always produce identical
//! chunks, and chunk order matches source order.

const CJK_TERMINATORS: [char; 4] = ['。', '！', '？', '；'];
const LATIN_TERMINATORS: [char; 4] = ['.', '!', '?', ';'];

/// Split `text` into ordered chunks of at most `max_chunk_size` characters
/// (oversized single words excepted). Empty or blank input produces an
/// empty sequence.
pub fn split(text: &str, max_chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        let para_len = char_len(para);

        // A paragraph that can never fit goes down a tier on its own.
        if para_len > max_chunk_size {
            flush(&mut chunks, &mut current, &mut current_len);
            split_paragraph(para, max_chunk_size, &mut chunks);
            continue;
        }

        let sep = if current_len == 0 { 0 } else { 2 };
        if current_len + sep + para_len > max_chunk_size {
            flush(&mut chunks, &mut current, &mut current_len);
        }
        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    flush(&mut chunks, &mut current, &mut current_len);
    chunks
}

/// Overlap variant: each chunk is prefixed with the trailing
/// `overlap_size / 2` characters of its predecessor and suffixed with the
/// leading `overlap_size / 2` characters of its successor, both trimmed to
/// word boundaries. Content is only ever duplicated, never removed.
pub fn split_with_overlap(text: &str, max_chunk_size: usize, overlap_size: usize) -> Vec<String> {
    let base = split(text, max_chunk_size);
    let half = overlap_size / 2;
    if half == 0 || base.len() < 2 {
        return base;
    }

    base.iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut out = String::new();
            if i > 0 {
                let tail = tail_chars(&base[i - 1], half);
                if !tail.is_empty() {
                    out.push_str(tail);
                    out.push(' ');
                }
            }
            out.push_str(chunk);
            if i + 1 < base.len() {
                let head = head_chars(&base[i + 1], half);
                if !head.is_empty() {
                    out.push(' ');
                    out.push_str(head);
                }
            }
            out
        })
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn flush(chunks: &mut Vec<String>, current: &mut String, current_len: &mut usize) {
    if !current.is_empty() {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        current.clear();
        *current_len = 0;
    }
}

/// Second tier: split an oversized paragraph on sentence boundaries.
fn split_paragraph(paragraph: &str, max_chunk_size: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in split_sentences(paragraph) {
        let sentence_len = char_len(sentence.trim_end());

        if sentence_len > max_chunk_size {
            flush(chunks, &mut current, &mut current_len);
            split_words(sentence, max_chunk_size, chunks);
            continue;
        }

        if current_len + sentence_len > max_chunk_size {
            flush(chunks, &mut current, &mut current_len);
        }
        current.push_str(sentence);
        current_len += char_len(sentence);
    }

    flush(chunks, &mut current, &mut current_len);
}

/// Slice `text` into sentences. A boundary sits after a CJK terminator, or
/// after a Latin terminator that is followed by whitespace (or input end).
/// Trailing whitespace stays attached to the preceding sentence so the
/// slices cover the input exactly.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut iter = text.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        let after = i + c.len_utf8();
        let boundary = if CJK_TERMINATORS.contains(&c) {
            true
        } else if LATIN_TERMINATORS.contains(&c) {
            match iter.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => true,
            }
        } else {
            false
        };
        if !boundary {
            continue;
        }

        let mut end = after;
        while let Some(&(j, next)) = iter.peek() {
            if next.is_whitespace() {
                end = j + next.len_utf8();
                iter.next();
            } else {
                break;
            }
        }
        out.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Last tier: split an oversized sentence on word boundaries. A word that
/// alone exceeds the budget is emitted as its own chunk, never cut.
fn split_words(sentence: &str, max_chunk_size: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in sentence.split_whitespace() {
        let word_len = char_len(word);
        let sep = if current_len == 0 { 0 } else { 1 };
        if current_len > 0 && current_len + sep + word_len > max_chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
}

/// Last `n` characters of `text`, advanced to the nearest following
/// whitespace so no word arrives cut in half.
fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    if char_len(text) <= n {
        return text;
    }
    let cut = text
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[cut..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

/// First `n` characters of `text`, backed up to the nearest preceding
/// whitespace so no word arrives cut in half.
fn head_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    if char_len(text) <= n {
        return text;
    }
    let cut = text
        .char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cut];
    match head.rfind(char::is_whitespace) {
        Some(pos) => head[..pos].trim_end(),
        None => head,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_no_chunks() {
        assert!(split("", 100).is_empty());
        assert!(split("   \n\n  \n\n", 100).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = split("Hello, world!", 100);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn paragraphs_under_limit_combine() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = split(text, 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn three_forty_char_paragraphs_split_on_paragraph_boundaries() {
        let para = "a".repeat(40);
        let text = format!("{para}\n\n{para}\n\n{para}");
        // 40 + 2 + 40 = 82 fits; adding the third (82 + 2 + 40 = 124) does not.
        let chunks = split(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{para}\n\n{para}"));
        assert_eq!(chunks[1], para);
    }

    #[test]
    fn oversized_paragraph_falls_back_to_sentences() {
        let text = "First sentence here. Second sentence here. Third sentence here.";
        let chunks = split(text, 45);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 45, "chunk too long: {c:?}");
            assert!(c.ends_with('.'), "sentence boundary lost: {c:?}");
        }
    }

    #[test]
    fn cjk_sentences_split_on_cjk_terminators() {
        let text = "这是第一句话。这是第二句话！这是第三句话？";
        let chunks = split(text, 8);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "这是第一句话。");
        assert_eq!(chunks[1], "这是第二句话！");
        assert_eq!(chunks[2], "这是第三句话？");
    }

    #[test]
    fn oversized_sentence_falls_back_to_words() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = split(text, 20);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 20);
        }
        // No word was cut.
        let rejoined = chunks.join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn single_oversized_word_emitted_whole() {
        let word = "x".repeat(50);
        let text = format!("tiny {word} tiny");
        let chunks = split(&text, 10);
        assert!(chunks.contains(&word));
    }

    #[test]
    fn decimal_point_is_not_a_sentence_boundary() {
        let sentences = split_sentences("pi is 3.14159 exactly. More text.");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "pi is 3.14159 exactly. ");
    }

    #[test]
    fn deterministic() {
        let text = "Alpha.\n\nBeta gamma delta. Epsilon!\n\n你好世界。再见。";
        assert_eq!(split(text, 15), split(text, 15));
    }

    #[test]
    fn resplitting_output_is_a_fixed_point() {
        let text = "One two three four five. Six seven eight nine ten.\n\n\
                    Eleven twelve thirteen fourteen. Fifteen sixteen!";
        let first = split(text, 30);
        for chunk in &first {
            assert_eq!(split(chunk, 30), vec![chunk.clone()]);
        }
    }

    #[test]
    fn concatenation_reconstructs_paragraph_text() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird one.";
        let chunks = split(text, 25);
        // Paragraph-tier chunks preserve content exactly; rejoining on the
        // separator restores the source.
        assert_eq!(chunks.join("\n\n"), text);
    }

    #[test]
    fn chunk_order_matches_source_order() {
        let text = (1..=20)
            .map(|i| format!("Paragraph number {i}."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = split(&text, 40);
        let mut last_seen = 0usize;
        for c in &chunks {
            let n: usize = c
                .split(&['r', '.'][..])
                .filter_map(|p| p.trim().parse().ok())
                .next()
                .unwrap();
            assert!(n > last_seen, "chunk order broken at {c:?}");
            last_seen = n;
        }
    }

    #[test]
    fn overlap_duplicates_context_at_boundaries() {
        let para = "alpha beta gamma delta".to_string();
        let text = format!("{para}\n\n{para}\n\n{para}");
        let plain = split(&text, 25);
        assert_eq!(plain.len(), 3);

        let overlapped = split_with_overlap(&text, 25, 12);
        assert_eq!(overlapped.len(), 3);
        // Middle chunk carries context from both neighbors.
        assert!(overlapped[1].chars().count() > plain[1].chars().count());
        // Base content is still present in order.
        for (with_overlap, base) in overlapped.iter().zip(&plain) {
            assert!(with_overlap.contains(base.as_str()));
        }
    }

    #[test]
    fn overlap_zero_is_identity() {
        let text = "one two three.\n\nfour five six.";
        assert_eq!(split_with_overlap(text, 20, 0), split(text, 20));
    }

    #[test]
    fn tail_and_head_respect_word_boundaries() {
        assert_eq!(tail_chars("alpha beta gamma", 7), "gamma");
        assert_eq!(head_chars("alpha beta gamma", 7), "alpha");
        assert_eq!(tail_chars("short", 10), "short");
        assert_eq!(head_chars("short", 10), "short");
    }
}
