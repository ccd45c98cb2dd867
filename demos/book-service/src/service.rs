//! The book service: one request enum, one response enum, one handler.

use chrono::{DateTime, Utc};
use relay_core::Context;
use relay_core::transaction::TransactionBackend;
use relay_core::validate::{Validate, ValidationErrors};
use relay_postgres::{PgExecutor, PostgresTxContext};
use relay_redpanda::Producer;
use relay_runtime::{Handler, HandlerFuture, ServiceError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Method name the save handler is registered under.
pub const SAVE_BOOK: &str = "book.SaveBook";

/// Topic announcing saved books.
pub const BOOK_CREATED_TOPIC: &str = "book.created";

/// Requests served by [`BookService`].
#[derive(Debug, Clone)]
pub enum BookRequest {
    /// Store a new book.
    SaveBook(SaveBook),
}

/// Responses returned by [`BookService`].
#[derive(Debug, Clone)]
pub enum BookResponse {
    /// The stored book.
    SaveBook(SavedBook),
}

/// A book to store.
#[derive(Debug, Clone)]
pub struct SaveBook {
    /// Title.
    pub title: String,
    /// Author.
    pub author: String,
    /// Library the book belongs to.
    pub library_id: i64,
}

/// A stored book.
#[derive(Debug, Clone)]
pub struct SavedBook {
    /// Assigned id.
    pub id: Uuid,
    /// Title.
    pub title: String,
}

impl Validate for BookRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            Self::SaveBook(book) => {
                let mut errors = ValidationErrors::new();
                errors.required("title", &book.title);
                errors.name_format("title", book.title.trim());
                errors.required("author", &book.author);
                errors.name_no_special("author", book.author.trim());
                errors.id("library_id", book.library_id);
                errors.into_result()
            }
        }
    }
}

/// Payload published on [`BOOK_CREATED_TOPIC`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCreated {
    /// Book id.
    pub id: Uuid,
    /// Title.
    pub title: String,
    /// Author.
    pub author: String,
    /// Library id.
    pub library_id: i64,
    /// When the book was stored.
    pub created_at: DateTime<Utc>,
}

/// Create the `books` table if it does not exist.
///
/// # Errors
///
/// Returns the database error.
pub async fn ensure_schema(tx: &PostgresTxContext) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS books (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            library_id BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(tx.backend().pool())
    .await?;
    Ok(())
}

/// Stores books and announces them.
pub struct BookService {
    tx: PostgresTxContext,
    producer: Arc<Producer>,
}

impl BookService {
    /// Create the service.
    #[must_use]
    pub const fn new(tx: PostgresTxContext, producer: Arc<Producer>) -> Self {
        Self { tx, producer }
    }

    /// The unwrapped handler for every [`BookRequest`].
    #[must_use]
    pub fn handler(self: Arc<Self>) -> Handler<BookRequest, BookResponse> {
        Arc::new(move |ctx: Context, req: BookRequest| -> HandlerFuture<BookResponse> {
            let service = Arc::clone(&self);
            Box::pin(async move {
                match req {
                    BookRequest::SaveBook(book) => service.save_book(&ctx, book).await.map(BookResponse::SaveBook),
                }
            })
        })
    }

    async fn save_book(&self, ctx: &Context, book: SaveBook) -> Result<SavedBook, ServiceError> {
        let event = BookCreated {
            id: Uuid::new_v4(),
            title: book.title.trim().to_string(),
            author: book.author.trim().to_string(),
            library_id: book.library_id,
            created_at: Utc::now(),
        };

        {
            let mut executor = self.tx.resolve(ctx).await;
            executor
                .execute(
                    sqlx::query(
                        "INSERT INTO books (id, title, author, library_id, created_at) VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(event.id)
                    .bind(&event.title)
                    .bind(&event.author)
                    .bind(event.library_id)
                    .bind(event.created_at),
                )
                .await
                .map_err(anyhow::Error::from)?;
        }

        let mut headers = HashMap::new();
        headers.insert("lang".to_string(), ctx.language().to_string());
        if let Some(request_id) = ctx.request_id() {
            headers.insert("request_id".to_string(), request_id.to_string());
        }

        self.producer
            .send_json(&event.id.to_string(), BOOK_CREATED_TOPIC, &event, headers)
            .await
            .map_err(anyhow::Error::from)?;

        tracing::info!(parent: ctx.span(), book_id = %event.id, "Book saved");
        Ok(SavedBook {
            id: event.id,
            title: event.title,
        })
    }
}
