pub mod config;
pub mod error;
pub mod events;
pub mod library;
pub mod source;
pub mod tasks {
    pub mod playback;
    pub mod prefetch;
    pub mod slideshow;
}
