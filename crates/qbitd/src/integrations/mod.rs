#[cfg(feature = "integration_qbittorrent")]
pub mod qbittorrent;
