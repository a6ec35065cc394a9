//! Dense vector helpers shared by the clustering stages.

/// Cosine similarity. Returns 0.0 when either vector has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Euclidean distance.
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Scales `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Returns a unit-length copy of `vector`.
#[must_use]
pub fn l2_normalized(vector: &[f32]) -> Vec<f32> {
    let mut out = vector.to_vec();
    l2_normalize(&mut out);
    out
}

/// Mean of the vectors at `indices`. Empty selection yields a zero vector of `dim`.
#[must_use]
pub fn mean_vector(vectors: &[Vec<f32>], indices: &[usize], dim: usize) -> Vec<f32> {
    let mut sum = vec![0.0_f32; dim];
    if indices.is_empty() {
        return sum;
    }
    for &index in indices {
        for (acc, value) in sum.iter_mut().zip(&vectors[index]) {
            *acc += value;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let count = indices.len() as f32;
    for value in &mut sum {
        *value /= count;
    }
    sum
}
