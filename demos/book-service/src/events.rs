//! Consumer side of `book.created`.

use crate::service::BookCreated;
use anyhow::Context as _;
use relay_core::messaging::InboundMessage;

/// Log a created book.
///
/// # Errors
///
/// Returns an error if the payload is not a [`BookCreated`].
pub async fn on_book_created(message: InboundMessage) -> anyhow::Result<()> {
    let book = decode(&message)?;
    tracing::info!(
        book_id = %book.id,
        title = %book.title,
        library_id = book.library_id,
        partition = message.partition,
        offset = message.offset,
        request_id = message.headers.get("request_id").map(String::as_str).unwrap_or_default(),
        "Book created"
    );
    Ok(())
}

fn decode(message: &InboundMessage) -> anyhow::Result<BookCreated> {
    serde_json::from_slice(&message.value)
        .with_context(|| format!("invalid book.created payload at offset {}", message.offset))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn inbound(value: Vec<u8>) -> InboundMessage {
        InboundMessage {
            key: "k".to_string(),
            topic: "book.created".to_string(),
            value,
            headers: Default::default(),
            partition: 0,
            offset: 3,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn created_book_is_accepted() {
        let event = BookCreated {
            id: Uuid::new_v4(),
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            library_id: 1,
            created_at: Utc::now(),
        };

        on_book_created(inbound(serde_json::to_vec(&event).unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let err = on_book_created(inbound(b"not json".to_vec())).await.unwrap_err();

        assert!(err.to_string().contains("offset 3"));
    }
}
