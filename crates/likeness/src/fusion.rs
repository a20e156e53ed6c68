//! Combine an image vector and a text vector into one query

use crate::embedding::{l2_norm, Embedding, MIN_NORM};
use crate::error::{LikenessError, Result};

/// Check an image weight before any vector work happens
pub fn validate_image_weight(image_weight: f32) -> Result<()> {
  if image_weight.is_nan() || !(0.0..=1.0).contains(&image_weight) {
    return Err(LikenessError::configuration(format!(
      "image_weight must be within [0, 1], got {image_weight}"
    )));
  }
  Ok(())
}

/// Fuse optional image and text vectors into a unit-length query.
///
/// With a single vector the weight is ignored and that vector is returned
/// renormalized. With both, the result is `w * image + (1 - w) * text`,
/// renormalized.
pub fn fuse(
  image: Option<&Embedding>,
  text: Option<&Embedding>,
  image_weight: f32,
) -> Result<Embedding> {
  validate_image_weight(image_weight)?;

  match (image, text) {
    (None, None) => Err(LikenessError::MissingQuery),
    (Some(single), None) | (None, Some(single)) => renormalize(single.as_slice().to_vec()),
    (Some(image), Some(text)) => {
      if image.dimension() != text.dimension() {
        return Err(LikenessError::dimension_mismatch(image.dimension(), text.dimension()));
      }

      let text_weight = 1.0 - image_weight;
      let combined = image
        .as_slice()
        .iter()
        .zip(text.as_slice())
        .map(|(i, t)| image_weight * i + text_weight * t)
        .collect();

      renormalize(combined)
    }
  }
}

fn renormalize(values: Vec<f32>) -> Result<Embedding> {
  let norm = l2_norm(&values);
  if !norm.is_finite() || norm < MIN_NORM {
    return Err(LikenessError::DegenerateQuery);
  }
  Embedding::normalized(values).ok_or(LikenessError::DegenerateQuery)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn unit(values: &[f32]) -> Embedding {
    Embedding::normalized(values.to_vec()).unwrap()
  }

  fn assert_close(actual: &Embedding, expected: &Embedding) {
    assert_eq!(actual.dimension(), expected.dimension());
    for (a, b) in actual.as_slice().iter().zip(expected.as_slice()) {
      assert!((a - b).abs() < 1e-6, "{actual:?} vs {expected:?}");
    }
  }

  #[test]
  fn test_rejects_out_of_range_weight_first() {
    for weight in [-0.1, 1.1, f32::NAN, f32::INFINITY] {
      // Even with no vectors the weight is the reported problem
      let result = fuse(None, None, weight);
      assert!(matches!(result, Err(LikenessError::Configuration { .. })), "weight {weight}");
    }
  }

  #[test]
  fn test_requires_at_least_one_vector() {
    assert!(matches!(fuse(None, None, 0.5), Err(LikenessError::MissingQuery)));
  }

  #[test]
  fn test_single_vector_ignores_weight() {
    let image = unit(&[0.6, 0.8]);
    for weight in [0.0, 0.3, 1.0] {
      assert_close(&fuse(Some(&image), None, weight).unwrap(), &image);
    }

    let text = unit(&[1.0, 1.0]);
    assert_close(&fuse(None, Some(&text), 1.0).unwrap(), &text);
  }

  #[test]
  fn test_boundary_weights_reproduce_single_modality() {
    let image = unit(&[1.0, 2.0, 3.0]);
    let text = unit(&[-3.0, 0.5, 1.0]);

    let image_only = fuse(Some(&image), Some(&text), 1.0).unwrap();
    let text_only = fuse(Some(&image), Some(&text), 0.0).unwrap();

    assert_close(&image_only, &image);
    assert_close(&text_only, &text);
  }

  #[test]
  fn test_fused_query_has_unit_norm() {
    let image = unit(&[0.2, 0.9, -0.4, 0.1]);
    let text = unit(&[0.7, -0.1, 0.3, 0.5]);

    for step in 0..=10 {
      let weight = step as f32 / 10.0;
      let fused = fuse(Some(&image), Some(&text), weight).unwrap();
      assert!((fused.norm() - 1.0).abs() < 1e-5, "weight {weight}");
    }
  }

  #[test]
  fn test_opposite_vectors_at_even_weight_are_degenerate() {
    let image = unit(&[1.0, 0.0]);
    let text = unit(&[-1.0, 0.0]);
    assert!(matches!(fuse(Some(&image), Some(&text), 0.5), Err(LikenessError::DegenerateQuery)));
  }

  #[test]
  fn test_dimension_disagreement() {
    let image = unit(&[1.0, 0.0]);
    let text = unit(&[1.0, 0.0, 0.0]);
    assert!(matches!(
      fuse(Some(&image), Some(&text), 0.5),
      Err(LikenessError::DimensionMismatch { expected: 2, actual: 3 })
    ));
  }
}
