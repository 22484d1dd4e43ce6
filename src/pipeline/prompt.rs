//! Prompt assembly: instruction + media references → ordered message list.
//!
//! The wire shape follows the OpenAI chat-completions schema so the same
//! [`Message`] list can be handed to either backend unchanged:
//!
//! ```json
//! {"role": "user", "content": [
//!   {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,..."}},
//!   {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,..."}},
//!   {"type": "text", "text": "Extract all of the structured information ..."}
//! ]}
//! ```
//!
//! ## Ordering convention
//!
//! Image parts come first, in page order, and the instruction text part comes
//! last. This is fixed for every call: the model reads the pages before it
//! reads what to do with them.

use crate::error::Doc2TextError;
use crate::pipeline::encode::MediaReference;
use crate::prompts::Instruction;
use serde::Serialize;

/// Per-message framing overhead in the token estimate.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Side of one vision patch, in pixels.
const IMAGE_PATCH_PX: u32 = 28;
/// Start/end markers around every image.
const IMAGE_MARKER_TOKENS: usize = 2;
/// Cost assumed for an image of unknown size.
pub const UNKNOWN_IMAGE_TOKENS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip)]
    pub dimensions: Option<(u32, u32)>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(reference: &MediaReference) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: reference.url().to_string(),
                dimensions: reference.dimensions(),
            },
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentPart::ImageUrl { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn image_count(&self) -> usize {
        self.content.iter().filter(|p| p.is_image()).count()
    }
}

/// Build the message list for one request.
///
/// Fails with [`Doc2TextError::TooManyImages`] before anything is built when
/// `references` exceeds `image_limit`; references are never truncated.
pub fn assemble(
    instruction: &Instruction,
    references: &[MediaReference],
    image_limit: usize,
    system_prompt: Option<&str>,
) -> Result<Vec<Message>, Doc2TextError> {
    if references.len() > image_limit {
        return Err(Doc2TextError::TooManyImages {
            count: references.len(),
            limit: image_limit,
        });
    }

    let mut content: Vec<ContentPart> = references.iter().map(ContentPart::image).collect();
    content.push(ContentPart::text(instruction.text()));

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system_prompt {
        messages.push(Message::system(system));
    }
    messages.push(Message {
        role: Role::User,
        content,
    });
    Ok(messages)
}

/// Rough prompt size in tokens.
///
/// Text costs one token per four characters plus a fixed per-message
/// overhead; an image costs one token per 28×28 patch plus its markers.
pub fn estimate_prompt_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            MESSAGE_OVERHEAD_TOKENS
                + m.content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => text.chars().count().div_ceil(4),
                        ContentPart::ImageUrl { image_url } => image_tokens(image_url.dimensions),
                    })
                    .sum::<usize>()
        })
        .sum()
}

fn image_tokens(dimensions: Option<(u32, u32)>) -> usize {
    match dimensions {
        Some((w, h)) => {
            (w.div_ceil(IMAGE_PATCH_PX) as usize) * (h.div_ceil(IMAGE_PATCH_PX) as usize)
                + IMAGE_MARKER_TOKENS
        }
        None => UNKNOWN_IMAGE_TOKENS,
    }
}
