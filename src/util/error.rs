/// エラー分類とリトライ判定ユーティリティ。
///
/// パイプライン自身はリトライしない。呼び出し側がこの分類を使って再実行方針を決める。
use reqwest::StatusCode;

use crate::error::PipelineError;
use crate::pipeline::embedding::EmbeddingError;

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// リトライ可能なエラー（一時的なネットワークエラー、タイムアウトなど）
    Retryable,
    /// リトライ不可能なエラー（バリデーションエラー、キャンセルなど）
    NonRetryable,
    /// 致命的なエラー（認証エラー、設定エラーなど）
    Fatal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
            Self::Fatal => "fatal",
        }
    }
}

/// パイプラインエラーを分類する。
#[must_use]
pub fn classify_error(error: &PipelineError) -> ErrorKind {
    match error {
        PipelineError::EmbeddingUnavailable(inner) => classify_embedding_error(inner),
        PipelineError::TimedOut { .. } => ErrorKind::Retryable,
        PipelineError::InvalidParameters(_) | PipelineError::Cancelled { .. } => {
            ErrorKind::NonRetryable
        }
        PipelineError::Worker(_) => ErrorKind::Fatal,
    }
}

fn classify_embedding_error(error: &EmbeddingError) -> ErrorKind {
    match error {
        EmbeddingError::Transport(err) => {
            if err.is_timeout() || err.is_connect() {
                return ErrorKind::Retryable;
            }
            err.status()
                .map_or(ErrorKind::NonRetryable, classify_status)
        }
        EmbeddingError::Status { status, .. } => StatusCode::from_u16(*status)
            .map_or(ErrorKind::NonRetryable, classify_status),
        EmbeddingError::Malformed(_) => ErrorKind::NonRetryable,
        EmbeddingError::Model(_) | EmbeddingError::Configuration(_) => ErrorKind::Fatal,
    }
}

fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        // 認証・認可エラーは致命的
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Fatal,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::Retryable,
        s if s.is_server_error() => ErrorKind::Retryable,
        _ => ErrorKind::NonRetryable,
    }
}

/// エラーがリトライ可能かどうかを判定する。
#[must_use]
pub fn is_retryable(error: &PipelineError) -> bool {
    matches!(classify_error(error), ErrorKind::Retryable)
}

/// エラーが致命的かどうかを判定する。
#[must_use]
pub fn is_fatal(error: &PipelineError) -> bool {
    matches!(classify_error(error), ErrorKind::Fatal)
}
