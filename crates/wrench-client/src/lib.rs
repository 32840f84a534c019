pub mod pdf;

pub use pdf::{PdfDownloader, PdfDownloaderConfig};
