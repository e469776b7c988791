// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message sanitization: strip image content when the model does not accept it.

use crate::{
    catalog::{InputModality, Model},
    types::{ContentBlock, Message, UserContent},
};

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Replace image blocks with a text placeholder when `model` is text-only.
/// A no-op for vision-capable models.
pub fn strip_images_if_unsupported(messages: Vec<Message>, model: &Model) -> Vec<Message> {
    if model.input.contains(&InputModality::Image) {
        return messages;
    }
    messages.into_iter().map(strip_message).collect()
}

fn strip_message(m: Message) -> Message {
    match m {
        Message::User {
            content: UserContent::Blocks(blocks),
            timestamp,
        } => {
            let stripped = strip_blocks(blocks);
            let content = match stripped.as_slice() {
                [ContentBlock::Text { text }] => UserContent::Text(text.clone()),
                _ => UserContent::Blocks(stripped),
            };
            Message::User { content, timestamp }
        }
        Message::ToolResult(mut r) => {
            r.content = strip_blocks(r.content);
            Message::ToolResult(r)
        }
        other => other,
    }
}

fn strip_blocks(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .map(|b| match b {
            ContentBlock::Image { .. } => ContentBlock::text(IMAGE_OMITTED),
            other => other,
        })
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{lookup, mock_model};

    fn image_block() -> ContentBlock {
        ContentBlock::Image {
            data: "iVBORw0KGgo=".into(),
            mime: "image/png".into(),
        }
    }

    #[test]
    fn no_op_for_vision_models() {
        let m = lookup("anthropic", "claude-opus-4-6").unwrap();
        let msgs = vec![Message::user_with_blocks(vec![
            ContentBlock::text("look"),
            image_block(),
        ])];
        let out = strip_images_if_unsupported(msgs.clone(), &m);
        assert_eq!(out, msgs);
    }

    #[test]
    fn strips_images_for_text_only_models() {
        let m = mock_model();
        let msgs = vec![Message::user_with_blocks(vec![
            ContentBlock::text("look"),
            image_block(),
        ])];
        let out = strip_images_if_unsupported(msgs, &m);
        match &out[0] {
            Message::User {
                content: UserContent::Blocks(blocks),
                ..
            } => {
                assert!(matches!(&blocks[1], ContentBlock::Text { text } if text == IMAGE_OMITTED));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lone_image_collapses_to_plain_text() {
        let m = mock_model();
        let msgs = vec![Message::user_with_blocks(vec![image_block()])];
        let out = strip_images_if_unsupported(msgs, &m);
        match &out[0] {
            Message::User {
                content: UserContent::Text(t),
                ..
            } => assert_eq!(t, IMAGE_OMITTED),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_result_images_are_stripped_too() {
        let m = mock_model();
        let mut r = match Message::tool_result("tc_1", "screenshot", "", false) {
            Message::ToolResult(r) => r,
            _ => unreachable!(),
        };
        r.content = vec![image_block()];
        let out = strip_images_if_unsupported(vec![Message::ToolResult(r)], &m);
        match &out[0] {
            Message::ToolResult(r) => {
                assert!(matches!(&r.content[0], ContentBlock::Text { text } if text == IMAGE_OMITTED));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
