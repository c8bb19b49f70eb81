use serde::{Deserialize, Serialize};

use crate::error::ProcessError;

use super::extract::PAGE_BREAK;
use super::Chunker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub content: String,
    pub chunk_index: u32,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub filename: String,
}

/// Packs blank-line separated paragraphs into chunks of at most
/// `chunk_size` characters. Paragraphs longer than that are split on
/// whitespace. Consecutive chunks share up to `overlap` trailing characters,
/// and a final chunk shorter than `min_chunk_size` is folded into its
/// predecessor on the same page.
#[derive(Debug, Clone)]
pub struct ParagraphChunker {
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
}

impl Default for ParagraphChunker {
    fn default() -> Self {
        Self::new(512, 50, 100)
    }
}

impl ParagraphChunker {
    pub fn new(chunk_size: usize, overlap: usize, min_chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size / 2),
            min_chunk_size,
        }
    }

    fn chunk_page(&self, page: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut current = String::new();

        for para in page.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let para_len = char_len(para);
            if para_len > self.chunk_size {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
                out.extend(self.split_long(para));
                continue;
            }

            if !current.is_empty() && char_len(&current) + 2 + para_len > self.chunk_size {
                let tail = overlap_tail(&current, self.overlap);
                out.push(std::mem::take(&mut current));
                if !tail.is_empty() && char_len(&tail) + 2 + para_len <= self.chunk_size {
                    current = tail;
                }
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
        if !current.is_empty() {
            out.push(current);
        }

        if out.len() > 1 && out.last().is_some_and(|c| char_len(c) < self.min_chunk_size) {
            if let Some(last) = out.pop() {
                if let Some(prev) = out.last_mut() {
                    prev.push_str("\n\n");
                    prev.push_str(&last);
                }
            }
        }
        out
    }

    fn split_long(&self, paragraph: &str) -> Vec<String> {
        let mut words: Vec<String> = Vec::new();
        for word in paragraph.split_whitespace() {
            if char_len(word) > self.chunk_size {
                let chars: Vec<char> = word.chars().collect();
                words.extend(chars.chunks(self.chunk_size).map(|c| c.iter().collect()));
            } else {
                words.push(word.to_string());
            }
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let mut end = start;
            let mut len = 0;
            while end < words.len() {
                let add = char_len(&words[end]) + usize::from(end > start);
                if end > start && len + add > self.chunk_size {
                    break;
                }
                len += add;
                end += 1;
            }
            pieces.push(words[start..end].join(" "));
            if end >= words.len() {
                break;
            }

            // Step back over trailing words for overlap, always advancing.
            let mut back = end;
            let mut overlap_len = 0;
            while back > start + 1 {
                let w = char_len(&words[back - 1]) + 1;
                if overlap_len + w > self.overlap {
                    break;
                }
                overlap_len += w;
                back -= 1;
            }
            start = back;
        }
        pieces
    }
}

impl Chunker for ParagraphChunker {
    fn chunk(&self, text: &str, metadata: &ChunkMetadata) -> Result<Vec<TextChunk>, ProcessError> {
        let paged = text.contains(PAGE_BREAK);
        let mut chunks = Vec::new();

        for (page_idx, page) in text.split(PAGE_BREAK).enumerate() {
            let page_number = paged.then_some(page_idx as u32 + 1);
            for content in self.chunk_page(page) {
                chunks.push(TextChunk {
                    content,
                    chunk_index: chunks.len() as u32,
                    page_number,
                });
            }
        }

        if chunks.is_empty() {
            return Err(ProcessError::NoChunks);
        }
        tracing::debug!(
            document_id = %metadata.document_id,
            chunks = chunks.len(),
            "Chunked text"
        );
        Ok(chunks)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Trailing whole words of `text` totalling at most `overlap` characters.
fn overlap_tail(text: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut len = 0;
    let mut start = words.len();
    while start > 0 {
        let w = char_len(words[start - 1]) + 1;
        if len + w > overlap {
            break;
        }
        len += w;
        start -= 1;
    }
    words[start..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChunkMetadata {
        ChunkMetadata {
            document_id: "doc".into(),
            filename: "doc.txt".into(),
        }
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = ParagraphChunker::default()
            .chunk("First paragraph.\n\nSecond paragraph.", &meta())
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "First paragraph.\n\nSecond paragraph.");
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].page_number, None);
    }

    #[test]
    fn test_paragraphs_respect_chunk_size() {
        let para = "word ".repeat(30);
        let text = vec![para.trim(); 6].join("\n\n");
        let chunker = ParagraphChunker::new(200, 0, 10);
        let chunks = chunker.chunk(&text, &meta()).unwrap();

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.content.chars().count() <= 200);
            assert_eq!(chunk.chunk_index, i as u32);
        }
    }

    #[test]
    fn test_long_paragraph_split_with_overlap() {
        let words: Vec<String> = (0..200).map(|i| format!("w{:03}", i)).collect();
        let text = words.join(" ");
        let chunker = ParagraphChunker::new(100, 20, 10);
        let chunks = chunker.chunk(&text, &meta()).unwrap();

        assert!(chunks.len() > 1);
        let first_last_word = chunks[0].content.split_whitespace().last().unwrap();
        assert!(chunks[1].content.contains(first_last_word));
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 100));
        assert!(chunks.last().unwrap().content.ends_with("w199"));
    }

    #[test]
    fn test_small_trailing_chunk_merged() {
        let big = "a".repeat(98);
        let text = format!("{}\n\n{}\n\ntiny", big, big);
        let chunker = ParagraphChunker::new(100, 0, 20);
        let chunks = chunker.chunk(&text, &meta()).unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].content.ends_with("\n\ntiny"));
    }

    #[test]
    fn test_page_numbers_from_form_feeds() {
        let text = "page one text\u{000C}page two text";
        let chunks = ParagraphChunker::default().chunk(text, &meta()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, Some(1));
        assert_eq!(chunks[1].page_number, Some(2));
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[test]
    fn test_blank_text_yields_no_chunks() {
        assert!(matches!(
            ParagraphChunker::default().chunk("\n\n  \n\n", &meta()),
            Err(ProcessError::NoChunks)
        ));
    }

    #[test]
    fn test_overlong_word_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = ParagraphChunker::new(100, 0, 1).chunk(&text, &meta()).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].content.len(), 50);
    }
}
