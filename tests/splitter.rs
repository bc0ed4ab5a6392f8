//! Properties of the message splitter over varied inputs.

use poe_telegram::chatbot::split::{split_message, TELEGRAM_MESSAGE_LIMIT};

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Whitespace is the only thing the splitter may drop or insert.
fn squash(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn sample_texts() -> Vec<String> {
    let sentence = "The model streams its answer in small fragments. ";
    let mut texts = vec![
        sentence.repeat(200),
        format!("{}\n\n{}", "a".repeat(5000), "tail paragraph"),
        (0..40).map(|i| format!("Paragraph {i}. {}", sentence.repeat(3))).collect::<Vec<_>>().join("\n\n"),
        "日本語のテキスト。".repeat(600),
        "word ".repeat(2000),
        "```rust\nfn main() {}\n```\n".repeat(300),
    ];
    texts.push(format!("{}\n\n\n\n{}", "x".repeat(4096), "y".repeat(4096)));
    texts.push("\n\n\n\n".to_string());
    texts.push("\n\n".repeat(40));
    texts.push(" \n ".repeat(50));
    texts
}

#[test]
fn every_chunk_fits_the_limit() {
    for limit in [16, 100, 1000, TELEGRAM_MESSAGE_LIMIT] {
        for text in sample_texts() {
            let chunks = split_message(&text, limit);
            assert!(!chunks.is_empty());
            for chunk in &chunks {
                assert!(char_len(chunk) <= limit, "chunk of {} chars exceeds {limit}", char_len(chunk));
            }
        }
    }
}

#[test]
fn content_is_preserved_in_order() {
    for limit in [16, 100, TELEGRAM_MESSAGE_LIMIT] {
        for text in sample_texts() {
            let chunks = split_message(&text, limit);
            assert_eq!(squash(&chunks.concat()), squash(&text), "content changed at limit {limit}");
        }
    }
}

#[test]
fn text_at_the_limit_is_untouched() {
    let text = "b".repeat(TELEGRAM_MESSAGE_LIMIT);
    assert_eq!(split_message(&text, TELEGRAM_MESSAGE_LIMIT), vec![text]);
}

#[test]
fn no_empty_chunks_for_nonempty_text() {
    for text in sample_texts().into_iter().filter(|t| !t.trim().is_empty()) {
        for chunk in split_message(&text, 100) {
            assert!(!chunk.is_empty());
        }
    }
}

#[test]
fn first_chunk_is_stable_under_resplitting() {
    for limit in [3, 16, 100, TELEGRAM_MESSAGE_LIMIT] {
        for text in sample_texts() {
            let first = split_message(&text, limit).swap_remove(0);
            assert_eq!(split_message(&first, limit), vec![first.clone()], "limit {limit}");
        }
    }
}

#[test]
fn blank_input_still_yields_a_chunk() {
    for (text, limit) in [("\n\n\n\n", 3), ("", 1), ("   ", 2), ("\n\n \n\n", 1)] {
        let chunks = split_message(text, limit);
        assert!(!chunks.is_empty(), "no chunks for {text:?} at limit {limit}");
        assert!(chunks.iter().all(|c| char_len(c) <= limit));
    }
}
