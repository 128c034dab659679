use crate::error::{Result, SetupError};
use crate::model::parts::TextEncoderPart;
use crate::model::tokenizer::Vocabulary;
use burn::prelude::*;
use tracing::{debug, info};

/// Token used to pad seed text shorter than the embedding
pub const PAD_TOKEN: &str = "*";

/// Learned token embedding occupying one or more rows of the embedding matrix
#[derive(Debug, Clone)]
pub struct ModelEmbedding<B: Backend> {
    /// Human-readable name, also used for the placeholder tokens
    pub name: String,
    /// `[token_count, dim]`
    pub vector: Tensor<B, 2>,
    /// Rows the embedding occupies once added to the text encoder
    pub token_ids: Vec<u32>,
    pub trainable: bool,
}

impl<B: Backend> ModelEmbedding<B> {
    pub fn new(name: impl Into<String>, vector: Tensor<B, 2>) -> Self {
        Self {
            name: name.into(),
            vector,
            token_ids: Vec::new(),
            trainable: true,
        }
    }

    pub fn token_count(&self) -> usize {
        self.vector.dims()[0]
    }

    /// Placeholder token strings, `<name_0>`, `<name_1>`, ...
    pub fn placeholder_tokens(&self) -> Vec<String> {
        (0..self.token_count())
            .map(|i| format!("<{}_{}>", self.name, i))
            .collect()
    }
}

/// Build a `[token_count, dim]` vector from the embeddings of `initial_text`.
///
/// The text is truncated to `token_count` tokens and padded with the `*` token.
pub fn create_new_embedding<B: Backend>(
    tokenizer: &dyn Vocabulary,
    text_encoder: &dyn TextEncoderPart<B>,
    initial_text: &str,
    token_count: usize,
) -> Result<Tensor<B, 2>> {
    let mut ids = tokenizer.encode(initial_text)?;
    ids.truncate(token_count);

    if ids.len() < token_count {
        let pad = tokenizer
            .token_id(PAD_TOKEN)
            .ok_or_else(|| SetupError::Tokenizer(format!("pad token '{}' is not in the vocabulary", PAD_TOKEN)))?;
        ids.resize(token_count, pad);
    }

    debug!("Initializing embedding from '{}' as tokens {:?}", initial_text, ids);
    Ok(text_encoder.token_embeddings().rows(&ids))
}

/// Register every embedding's placeholder tokens, grow the embedding matrix and
/// write the vectors into their rows.
///
/// Returns the ids of rows that stay trainable.
pub fn add_embeddings_to_text_encoder<B: Backend>(
    tokenizer: &mut dyn Vocabulary,
    text_encoder: &mut dyn TextEncoderPart<B>,
    embeddings: &mut [ModelEmbedding<B>],
) -> Result<Vec<u32>> {
    let mut trainable_ids = Vec::new();

    for embedding in embeddings.iter_mut() {
        let ids = tokenizer.add_tokens(&embedding.placeholder_tokens())?;

        let table = text_encoder.token_embeddings_mut();
        table.resize(tokenizer.len());
        let dim = table.dim();
        for (row, &id) in ids.iter().enumerate() {
            let vector = embedding.vector.clone().slice([row..row + 1, 0..dim]);
            table.write_row(id, vector);
        }

        info!(
            "Added embedding '{}' as {} tokens at ids {:?}",
            embedding.name,
            ids.len(),
            ids
        );

        if embedding.trainable {
            trainable_ids.extend_from_slice(&ids);
        }
        embedding.token_ids = ids;
    }

    Ok(trainable_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parts::{ClipTextEncoder, FrozenModule, LinearSpec, TokenEmbeddings};
    use crate::model::tokenizer::WordVocabulary;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn encoder() -> ClipTextEncoder<TestBackend> {
        let device = Default::default();
        let body = FrozenModule::seeded("text_encoder", &[LinearSpec::new("q", 4, 4)], 1, &device);
        ClipTextEncoder::new(body, TokenEmbeddings::seeded(4, 4, 9, &device))
    }

    fn vocab() -> WordVocabulary {
        WordVocabulary::new(&["a", "photo", "of", "*"])
    }

    #[test]
    fn test_new_embedding_copies_seed_rows_and_pads() {
        let encoder = encoder();
        let vector = create_new_embedding::<TestBackend>(&vocab(), &encoder, "photo", 3).unwrap();
        assert_eq!(vector.dims(), [3, 4]);

        let expected = encoder.token_embeddings().rows(&[1, 3, 3]);
        assert_eq!(
            vector.to_data().to_vec::<f32>().unwrap(),
            expected.to_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_new_embedding_truncates() {
        let vector = create_new_embedding::<TestBackend>(&vocab(), &encoder(), "a photo of", 2).unwrap();
        assert_eq!(vector.dims(), [2, 4]);
    }

    #[test]
    fn test_missing_pad_token_is_an_error() {
        let vocab = WordVocabulary::new(&["a"]);
        let err = create_new_embedding::<TestBackend>(&vocab, &encoder(), "a", 2).unwrap_err();
        assert!(matches!(err, SetupError::Tokenizer(_)));
    }

    #[test]
    fn test_add_embeddings_grows_matrix() {
        let mut vocab = vocab();
        let mut encoder = encoder();
        let vector = create_new_embedding::<TestBackend>(&vocab, &encoder, "a photo", 2).unwrap();
        let mut embeddings = vec![ModelEmbedding::new("embedding", vector.clone())];

        let trainable = add_embeddings_to_text_encoder::<TestBackend>(&mut vocab, &mut encoder, &mut embeddings).unwrap();

        assert_eq!(trainable, vec![4, 5]);
        assert_eq!(embeddings[0].token_ids, vec![4, 5]);
        assert_eq!(encoder.token_embeddings().num_tokens(), 6);
        assert_eq!(
            encoder.token_embeddings().rows(&[4, 5]).to_data().to_vec::<f32>().unwrap(),
            vector.to_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_frozen_embedding_not_trainable() {
        let mut vocab = vocab();
        let mut encoder = encoder();
        let vector = create_new_embedding::<TestBackend>(&vocab, &encoder, "a", 1).unwrap();
        let mut embedding = ModelEmbedding::new("style", vector);
        embedding.trainable = false;
        let mut embeddings = vec![embedding];

        let trainable = add_embeddings_to_text_encoder::<TestBackend>(&mut vocab, &mut encoder, &mut embeddings).unwrap();
        assert!(trainable.is_empty());
        assert_eq!(embeddings[0].token_ids, vec![4]);
    }
}
