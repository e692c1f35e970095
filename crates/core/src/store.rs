use crate::models::{Candidate, PdfChunk};

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: PdfChunk,
    pub score: f64,
}

impl VectorHit {
    pub fn into_candidate(self) -> Candidate {
        Candidate::new(self.chunk, self.score)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkFilter {
    pub document_id: Option<String>,
    pub has_table: Option<bool>,
}

impl ChunkFilter {
    pub fn matches(&self, chunk: &PdfChunk) -> bool {
        self.document_id
            .as_deref()
            .map_or(true, |id| chunk.document_id == id)
            && self
                .has_table
                .map_or(true, |flag| chunk.metadata.has_table == flag)
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right.iter()).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm < f32::EPSILON || right_norm < f32::EPSILON {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}
