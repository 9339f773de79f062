// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! History sanitization passes applied before messages are stored or sent.

use crate::{ContentBlock, Message, MessageContent};

/// How many of the most recent messages may keep raw image payloads.
pub const IMAGE_FRESHNESS_WINDOW: usize = 8;

/// Replace image blocks outside the freshness window with compact text
/// placeholders that preserve the MIME type and approximate payload size.
///
/// Old screenshots dominate token usage while contributing almost nothing:
/// the model has already acted on them.  The placeholder keeps the fact that
/// an image was there (and how big) without the base64 payload.  Returns the
/// number of image blocks replaced.
pub fn expire_stale_images(messages: &mut [Message]) -> usize {
    let len = messages.len();
    let cutoff = len.saturating_sub(IMAGE_FRESHNESS_WINDOW);
    let mut replaced = 0;
    for msg in messages.iter_mut().take(cutoff) {
        replaced += expire_images_in(msg);
    }
    replaced
}

fn expire_images_in(msg: &mut Message) -> usize {
    let MessageContent::Blocks(blocks) = &mut msg.content else {
        return 0;
    };
    let mut replaced = 0;
    for block in blocks.iter_mut() {
        if let ContentBlock::Image { media_type, data } = block {
            let approx_kib = (data.len() * 3 / 4) / 1024;
            *block = ContentBlock::text(format!(
                "[image removed from context: {media_type}, ~{approx_kib} KiB]"
            ));
            replaced += 1;
        }
    }
    replaced
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn image_msg() -> Message {
        Message::user_blocks(vec![
            ContentBlock::text("screenshot:"),
            ContentBlock::Image { media_type: "image/png".into(), data: "A".repeat(4096) },
        ])
    }

    #[test]
    fn images_inside_window_are_kept() {
        let mut msgs: Vec<Message> = (0..4).map(|_| image_msg()).collect();
        let replaced = expire_stale_images(&mut msgs);
        assert_eq!(replaced, 0);
        assert!(msgs.iter().all(|m| m.has_image()));
    }

    #[test]
    fn images_older_than_window_become_placeholders() {
        let mut msgs: Vec<Message> = (0..IMAGE_FRESHNESS_WINDOW + 3).map(|_| image_msg()).collect();
        let replaced = expire_stale_images(&mut msgs);
        assert_eq!(replaced, 3);
        assert!(!msgs[0].has_image());
        assert!(msgs.last().unwrap().has_image());
    }

    #[test]
    fn placeholder_preserves_mime_and_size() {
        let mut msgs: Vec<Message> = (0..IMAGE_FRESHNESS_WINDOW + 1).map(|_| image_msg()).collect();
        expire_stale_images(&mut msgs);
        let text = msgs[0].text_content();
        assert!(text.contains("image/png"), "placeholder must name the MIME type: {text}");
        assert!(text.contains("KiB"), "placeholder must state approximate size: {text}");
    }

    #[test]
    fn plain_text_messages_are_untouched() {
        let mut msgs: Vec<Message> = (0..IMAGE_FRESHNESS_WINDOW + 2)
            .map(|i| Message::user(format!("msg {i}")))
            .collect();
        assert_eq!(expire_stale_images(&mut msgs), 0);
        assert_eq!(msgs[0].as_text(), Some("msg 0"));
    }

    #[test]
    fn expire_is_idempotent() {
        let mut msgs: Vec<Message> = (0..IMAGE_FRESHNESS_WINDOW + 2).map(|_| image_msg()).collect();
        expire_stale_images(&mut msgs);
        let snapshot = msgs.clone();
        let second = expire_stale_images(&mut msgs);
        assert_eq!(second, 0);
        assert_eq!(msgs, snapshot);
    }
}
