pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Http(#[from] reqwest::Error),
	#[error("Distribution endpoint returned {status} for {url}.")]
	Status { url: String, status: u16 },
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("{message}")]
	InvalidUrl { message: String },
}
