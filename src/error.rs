#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A frame marker was empty, or a head and foot marker were identical.
    #[error("Invalid frame marker: {0}")]
    InvalidMarker(String),

    /// Chip coordinates outside of the detector, i.e., layer >= 40, chip >= 9, bank >= 2.
    #[error("Chip coordinates out of range: layer={layer} chip={chip} bank={bank}")]
    OutOfRange { layer: usize, chip: usize, bank: u8 },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
