//! CLIP-style embedder running vision and text ONNX graphs

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::imageops::FilterType;
use ndarray::{Axis, Ix2};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::Tokenizer;

use crate::config::EngineConfig;
use crate::embedding::{Embedder, Embedding};
use crate::error::{ExtractionError, LikenessError, Result};

const IMAGE_SIZE: u32 = 224;
const CONTEXT_LENGTH: usize = 77;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct OnnxClipEmbedder {
  vision: Mutex<Session>,
  text: Mutex<Session>,
  text_takes_mask: bool,
  tokenizer: Tokenizer,
}

fn load_session(path: &Path, intra_threads: usize) -> Result<Session> {
  let fail = |e: ort::Error| {
    LikenessError::configuration(format!("cannot load ONNX model {}: {e}", path.display()))
  };
  Session::builder()
    .map_err(fail)?
    .with_optimization_level(GraphOptimizationLevel::Level1)
    .map_err(fail)?
    .with_intra_threads(intra_threads.max(1))
    .map_err(fail)?
    .commit_from_file(path)
    .map_err(fail)
}

impl OnnxClipEmbedder {
  /// Load the vision model, text model and tokenizer named in the configuration
  pub fn from_config(config: &EngineConfig) -> Result<Self> {
    let onnx = &config.onnx;
    Self::new(
      &config.resolve_model_path(&onnx.vision_model),
      &config.resolve_model_path(&onnx.text_model),
      &config.resolve_model_path(&onnx.tokenizer),
      onnx.intra_threads,
    )
  }

  pub fn new(
    vision_model: &Path,
    text_model: &Path,
    tokenizer_path: &Path,
    intra_threads: usize,
  ) -> Result<Self> {
    ort::init()
      .with_name("likeness")
      .commit()
      .map_err(|e| LikenessError::configuration(format!("cannot initialize ONNX Runtime: {e}")))?;

    let vision = load_session(vision_model, intra_threads)?;
    let text = load_session(text_model, intra_threads)?;
    let text_takes_mask = text.inputs.len() > 1;

    let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
      LikenessError::configuration(format!("cannot load tokenizer {}: {e}", tokenizer_path.display()))
    })?;

    tracing::info!(
      vision = %vision_model.display(),
      text = %text_model.display(),
      "ONNX embedder ready"
    );

    Ok(Self { vision: Mutex::new(vision), text: Mutex::new(text), text_takes_mask, tokenizer })
  }

  /// Decode and normalize one image into CHW planes
  fn preprocess(path: &Path) -> std::result::Result<Vec<f32>, ExtractionError> {
    let img = image::open(path)
      .map_err(|e| ExtractionError::for_path(path, format!("cannot decode image: {e}")))?;
    let rgb = img.resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle).to_rgb8();

    let plane = (IMAGE_SIZE * IMAGE_SIZE) as usize;
    let mut tensor = vec![0.0f32; 3 * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
      for channel in 0..3 {
        tensor[channel * plane + i] =
          (f32::from(pixel[channel]) / 255.0 - CLIP_MEAN[channel]) / CLIP_STD[channel];
      }
    }
    Ok(tensor)
  }

  /// Run the vision model over preprocessed images, one output row per image
  fn run_vision(&self, pixels: &[f32], count: usize) -> std::result::Result<Vec<Vec<f32>>, String> {
    let size = IMAGE_SIZE as usize;
    let input = TensorRef::from_array_view(([count, 3, size, size], pixels)).map_err(|e| e.to_string())?;

    let mut session = self.vision.lock().map_err(|_| "vision session lock poisoned".to_string())?;
    let outputs = session.run(ort::inputs![input]).map_err(|e| e.to_string())?;
    let rows = outputs[0]
      .try_extract_array::<f32>()
      .map_err(|e| e.to_string())?
      .into_dimensionality::<Ix2>()
      .map_err(|e| e.to_string())?;

    Ok(rows.axis_iter(Axis(0)).map(|row| row.iter().copied().collect()).collect())
  }

  fn tokenize(&self, text: &str) -> std::result::Result<(Vec<i64>, Vec<i64>), ExtractionError> {
    let encoding = self
      .tokenizer
      .encode(text, true)
      .map_err(|e| ExtractionError::new(text, format!("cannot tokenize: {e}")))?;
    let pad_id = self.tokenizer.get_padding().map(|p| p.pad_id).unwrap_or(0);

    let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
    let mut mask: Vec<i64> = encoding.get_attention_mask().iter().map(|&m| i64::from(m)).collect();
    ids.truncate(CONTEXT_LENGTH);
    mask.truncate(CONTEXT_LENGTH);
    ids.resize(CONTEXT_LENGTH, i64::from(pad_id));
    mask.resize(CONTEXT_LENGTH, 0);

    Ok((ids, mask))
  }
}

fn to_embedding(input: &str, values: Vec<f32>) -> std::result::Result<Embedding, ExtractionError> {
  Embedding::normalized(values)
    .ok_or_else(|| ExtractionError::new(input, "model returned a zero or non-finite vector"))
}

impl Embedder for OnnxClipEmbedder {
  fn extract_image(&self, path: &Path) -> std::result::Result<Embedding, ExtractionError> {
    let mut results = self.extract_image_batch(&[path.to_path_buf()]);
    results.pop().unwrap_or_else(|| Err(ExtractionError::for_path(path, "no model output")))
  }

  fn extract_text(&self, text: &str) -> std::result::Result<Embedding, ExtractionError> {
    let (ids, mask) = self.tokenize(text)?;
    let fail = |message: String| ExtractionError::new(text, message);

    let ids_tensor =
      TensorRef::from_array_view(([1, CONTEXT_LENGTH], &*ids)).map_err(|e| fail(e.to_string()))?;
    let mut session = self.text.lock().map_err(|_| fail("text session lock poisoned".into()))?;
    let outputs = if self.text_takes_mask {
      let mask_tensor = TensorRef::from_array_view(([1, CONTEXT_LENGTH], &*mask))
        .map_err(|e| fail(e.to_string()))?;
      session.run(ort::inputs![ids_tensor, mask_tensor])
    } else {
      session.run(ort::inputs![ids_tensor])
    }
    .map_err(|e| fail(e.to_string()))?;

    let values: Vec<f32> =
      outputs[0].try_extract_array::<f32>().map_err(|e| fail(e.to_string()))?.iter().copied().collect();
    to_embedding(text, values)
  }

  /// Decode every path, then embed all decodable images in one model call
  fn extract_image_batch(&self, paths: &[PathBuf]) -> Vec<std::result::Result<Embedding, ExtractionError>> {
    let mut results: Vec<Option<std::result::Result<Embedding, ExtractionError>>> =
      paths.iter().map(|_| None).collect();
    let mut pixels = Vec::new();
    let mut decoded = Vec::new();

    for (i, path) in paths.iter().enumerate() {
      match Self::preprocess(path) {
        Ok(tensor) => {
          pixels.extend_from_slice(&tensor);
          decoded.push(i);
        }
        Err(e) => results[i] = Some(Err(e)),
      }
    }

    if !decoded.is_empty() {
      match self.run_vision(&pixels, decoded.len()) {
        Ok(rows) => {
          for (slot, row) in decoded.iter().zip(rows) {
            results[*slot] = Some(to_embedding(&paths[*slot].display().to_string(), row));
          }
        }
        Err(message) => {
          for slot in &decoded {
            results[*slot] = Some(Err(ExtractionError::for_path(&paths[*slot], message.clone())));
          }
        }
      }
    }

    results
      .into_iter()
      .zip(paths)
      .map(|(result, path)| {
        result.unwrap_or_else(|| Err(ExtractionError::for_path(path, "no model output")))
      })
      .collect()
  }
}
