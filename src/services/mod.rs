pub mod apply_service;
pub mod bookmark_store;
pub mod extract_service;
pub mod llm_service;
pub mod organize_service;
pub mod response_decoder;
pub mod settings_service;
pub mod tag_sync_service;
