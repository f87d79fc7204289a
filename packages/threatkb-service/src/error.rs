use serde::Serialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Validation error: {message}")]
	Validation { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Upstream fetch error: {message}")]
	UpstreamFetch { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
}
impl Error {
	pub fn validation(message: impl Into<String>) -> Self {
		Self::Validation { message: message.into() }
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::NotFound { message: message.into() }
	}

	pub fn code(&self) -> u16 {
		match self {
			Self::Validation { .. } => 400,
			Self::NotFound { .. } => 404,
			Self::UpstreamFetch { .. } => 502,
			Self::Storage { .. } => 500,
		}
	}

	pub fn body(&self) -> ErrorBody {
		let message = match self {
			Self::Validation { message }
			| Self::NotFound { message }
			| Self::UpstreamFetch { message }
			| Self::Storage { message } => message.clone(),
		};

		ErrorBody { message, code: self.code() }
	}
}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<threatkb_storage::Error> for Error {
	fn from(err: threatkb_storage::Error) -> Self {
		match err {
			threatkb_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			threatkb_storage::Error::Serde(inner) => Self::Storage { message: inner.to_string() },
			threatkb_storage::Error::InvalidArgument(message) => Self::Validation { message },
			threatkb_storage::Error::NotFound(message) => Self::NotFound { message },
			threatkb_storage::Error::Conflict(message) => Self::Storage { message },
		}
	}
}

impl From<threatkb_providers::Error> for Error {
	fn from(err: threatkb_providers::Error) -> Self {
		Self::UpstreamFetch { message: err.to_string() }
	}
}

/// The shape every user-visible error is rendered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
	pub message: String,
	pub code: u16,
}

#[cfg(test)]
mod tests {
	use super::Error;

	#[test]
	fn bodies_carry_message_and_code() {
		let body = Error::not_found("No cwe object matches CWE-9999.").body();

		assert_eq!(body.code, 404);
		assert_eq!(body.message, "No cwe object matches CWE-9999.");
		assert_eq!(
			serde_json::to_value(&body).expect("Failed to serialize body."),
			serde_json::json!({ "message": "No cwe object matches CWE-9999.", "code": 404 })
		);
	}

	#[test]
	fn store_errors_keep_their_category() {
		let err: Error = threatkb_storage::Error::InvalidArgument("bad".to_string()).into();

		assert_eq!(err.code(), 400);

		let err: Error = threatkb_storage::Error::Conflict("busy".to_string()).into();

		assert_eq!(err.code(), 500);
	}
}
