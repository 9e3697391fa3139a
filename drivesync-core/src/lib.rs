mod client;
mod oauth;

pub use client::{
    ApiErrorClass, CHUNK_ALIGNMENT, ChunkOutcome, DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE,
    FileList, aligned_chunk_size, children_query, escape_query_value, folder_query,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
