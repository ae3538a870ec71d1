use std::sync::Arc;

use tracing::debug;

use crate::runtime::{GenerationParams, ModelGateway, RuntimeMessage};
use crate::session::ChatMessage;

pub const HISTORY_WINDOW: usize = 6;

const MULTI_IMAGE_PLACEHOLDER: &str = "Analyze these images.";
const SINGLE_IMAGE_PLACEHOLDER: &str = "Analyze this image.";
const EMPTY_PLACEHOLDER: &str = "...";

/// Builds the runtime payload from a chronological history.
///
/// Keeps the last `window` turns, forwards images only on the final turn,
/// never emits blank content, and turns every image reference into a bare
/// filesystem path. Pure: the same input always yields the same payload.
pub fn assemble(history: &[ChatMessage], window: usize) -> Vec<RuntimeMessage> {
    let start = history.len().saturating_sub(window);
    let recent = &history[start..];
    let last = recent.len().saturating_sub(1);

    recent
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let images: Vec<String> = if i == last {
                msg.images.iter().map(|uri| normalize_image_path(uri)).collect()
            } else {
                Vec::new()
            };
            let content = sanitize_content(&msg.content, images.len());
            RuntimeMessage { role: msg.role, content, images }
        })
        .collect()
}

fn sanitize_content(text: &str, image_count: usize) -> String {
    let base = if text.trim().is_empty() {
        match image_count {
            0 => EMPTY_PLACEHOLDER,
            1 => SINGLE_IMAGE_PLACEHOLDER,
            _ => MULTI_IMAGE_PLACEHOLDER,
        }
        .to_string()
    } else {
        text.to_string()
    };
    // the model overlooks extra attachments unless the text calls them out
    if image_count > 1 && !text.to_lowercase().contains("image") {
        format!("(I have sent {image_count} images) {base}")
    } else {
        base
    }
}

/// Percent-decodes `uri` and drops a `file://` scheme.
pub fn normalize_image_path(uri: &str) -> String {
    let decoded = urlencoding::decode(uri).map(|s| s.into_owned()).unwrap_or_else(|_| uri.to_string());
    match decoded.strip_prefix("file://") {
        Some(path) => path.to_string(),
        None => decoded,
    }
}

pub struct ConversationAssembler {
    gateway: Arc<ModelGateway>,
    window: usize,
}

impl ConversationAssembler {
    pub fn new(gateway: Arc<ModelGateway>, window: usize) -> Self {
        Self { gateway, window: window.max(1) }
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    pub fn assemble(&self, history: &[ChatMessage]) -> Vec<RuntimeMessage> {
        assemble(history, self.window)
    }

    /// Produces the assistant reply for `history`. Runtime failures come back
    /// as a fixed fallback text.
    pub async fn respond(&self, history: &[ChatMessage], params: &GenerationParams) -> String {
        let payload = self.assemble(history);
        debug!(
            turns = history.len(),
            sent = payload.len(),
            images = payload.last().map(|m| m.images.len()).unwrap_or(0),
            "assembled conversation"
        );
        self.gateway.complete(payload, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::gateway::CHAT_FALLBACK;
    use crate::session::Role;

    fn history(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let images = if i % 2 == 0 { vec![format!("file:///pics/{i}.jpg")] } else { vec![] };
                let text = if i % 3 == 0 { String::new() } else { format!("turn {i}") };
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                ChatMessage::new(role, text, images)
            })
            .collect()
    }

    #[test]
    fn window_bounds_output_length() {
        for n in 0..15 {
            let out = assemble(&history(n), HISTORY_WINDOW);
            assert_eq!(out.len(), n.min(HISTORY_WINDOW), "history of {n}");
        }
    }

    #[test]
    fn keeps_most_recent_turns_in_chronological_order() {
        let h = history(10);
        let out = assemble(&h, HISTORY_WINDOW);
        let contents: Vec<&str> = out.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 4", "turn 5", "...", "turn 7", "turn 8", "..."]);
    }

    #[test]
    fn only_the_last_turn_carries_images() {
        for n in 1..12 {
            let mut h = history(n);
            h.last_mut().unwrap().images = vec!["file:///pics/now.jpg".into()];
            let out = assemble(&h, HISTORY_WINDOW);
            let (last, rest) = out.split_last().unwrap();
            assert!(rest.iter().all(|m| m.images.is_empty()));
            assert_eq!(last.images, vec!["/pics/now.jpg".to_string()]);
        }
    }

    #[test]
    fn content_is_never_blank() {
        for n in 0..12 {
            for m in assemble(&history(n), HISTORY_WINDOW) {
                assert!(!m.content.trim().is_empty());
            }
        }
        let h = vec![ChatMessage::user("  ", vec![])];
        assert_eq!(assemble(&h, HISTORY_WINDOW)[0].content, "...");
        let h = vec![ChatMessage::user("", vec!["a.jpg".into()])];
        assert_eq!(assemble(&h, HISTORY_WINDOW)[0].content, "Analyze this image.");
    }

    #[test]
    fn stripped_history_turns_do_not_claim_images() {
        let h = vec![ChatMessage::user("", vec!["old.jpg".into()]), ChatMessage::assistant("It is a cat.")];
        let out = assemble(&h, HISTORY_WINDOW);
        assert_eq!(out[0].content, "...");
        assert!(out[0].images.is_empty());
    }

    #[test]
    fn multiple_images_are_announced() {
        let h = vec![ChatMessage::user("", vec!["a.jpg".into(), "b.jpg".into()])];
        let out = assemble(&h, HISTORY_WINDOW);
        assert!(out[0].content.contains("2 images"), "got {:?}", out[0].content);
        assert_eq!(out[0].images.len(), 2);

        let h = vec![ChatMessage::user("compare", vec!["a.jpg".into(), "b.jpg".into(), "c.jpg".into()])];
        assert_eq!(assemble(&h, HISTORY_WINDOW)[0].content, "(I have sent 3 images) compare");

        let h = vec![ChatMessage::user("Which image is brighter?", vec!["a.jpg".into(), "b.jpg".into()])];
        assert_eq!(assemble(&h, HISTORY_WINDOW)[0].content, "Which image is brighter?");
    }

    #[test]
    fn assembly_is_deterministic() {
        let h = history(9);
        assert_eq!(assemble(&h, HISTORY_WINDOW), assemble(&h, HISTORY_WINDOW));
    }

    #[test]
    fn image_paths_are_decoded_and_unschemed() {
        assert_eq!(normalize_image_path("file:///var/mobile/My%20Photo.jpg"), "/var/mobile/My Photo.jpg");
        assert_eq!(normalize_image_path("/already/plain.png"), "/already/plain.png");
        assert_eq!(normalize_image_path("relative%2Fpath.png"), "relative/path.png");
        assert_eq!(normalize_image_path("bad%FFbyte.png"), "bad%FFbyte.png");
    }

    #[tokio::test]
    async fn respond_sends_window_and_hides_runtime_errors() {
        let rt = Arc::new(FakeRuntime::replying("Looks like a sunset."));
        let gw = Arc::new(ModelGateway::new(rt.clone(), "m"));
        let assembler = ConversationAssembler::new(gw, HISTORY_WINDOW);
        let reply = assembler.respond(&history(8), &GenerationParams::default()).await;
        assert_eq!(reply, "Looks like a sunset.");
        assert_eq!(rt.last_request().unwrap().messages.len(), HISTORY_WINDOW);

        let failing = ConversationAssembler::new(Arc::new(ModelGateway::new(Arc::new(FakeRuntime::failing("x")), "m")), 6);
        assert_eq!(failing.respond(&history(2), &GenerationParams::default()).await, CHAT_FALLBACK);
    }
}
