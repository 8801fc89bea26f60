use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("MongoDB error: {0}")]
    MongoError(#[from] mongodb::error::Error),

    #[error("Failed to serialize document: {0}")]
    SerializationError(#[from] mongodb::bson::ser::Error),

    #[error("Failed to deserialize document: {0}")]
    DeserializationError(#[from] mongodb::bson::de::Error),

    #[error("Failed to serialize document: {0}")]
    FailedToSerializeDocument(String),

    #[error("Item already exists: {0}")]
    ItemAlreadyExists(String),

    #[error("Failed to update item: {0}")]
    UpdateFailed(String),
}
