//! Thumbnail fetching and scaling
//!
//! Downloads a remote thumbnail, scales it down to the configured bounds
//! when it is larger, and hands back JPEG bytes plus dimensions for
//! storage on the media row.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, info};

const USER_AGENT: &str = concat!("chansync/", env!("CARGO_PKG_VERSION"));

/// Raised when the remote URL has no image; the caller treats this as a
/// permanent miss rather than a retryable failure.
#[derive(Debug, thiserror::Error)]
#[error("no thumbnail at remote URL")]
pub struct NoThumbnail;

/// A fetched thumbnail ready for storage
#[derive(Debug, Clone)]
pub struct FetchedThumbnail {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub struct ThumbnailService {
    http: reqwest::Client,
    max_width: u32,
    max_height: u32,
}

impl ThumbnailService {
    pub fn new(max_width: u32, max_height: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build thumbnail HTTP client")?;
        Ok(Self {
            http,
            max_width,
            max_height,
        })
    }

    /// Fetch a thumbnail and scale it into bounds
    pub async fn fetch(&self, url: &str) -> Result<FetchedThumbnail> {
        debug!(url = %url, "Fetching thumbnail");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to fetch thumbnail")?;
        if response.status().as_u16() == 404 {
            return Err(anyhow!(NoThumbnail));
        }
        if !response.status().is_success() {
            bail!("thumbnail fetch returned status {}", response.status());
        }
        let body = response
            .bytes()
            .await
            .context("Failed to read thumbnail body")?;

        let image = image::load_from_memory(&body).context("Failed to decode thumbnail")?;
        let image = self.scale_into_bounds(image);

        let mut jpeg = Vec::new();
        image
            .to_rgb8()
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .context("Failed to encode thumbnail as JPEG")?;

        info!(url = %url, width = image.width(), height = image.height(), "Fetched thumbnail");
        Ok(FetchedThumbnail {
            width: image.width(),
            height: image.height(),
            jpeg,
        })
    }

    /// Scale to the configured height keeping the ratio; wider results are
    /// center-cropped, narrower ones stretched to the exact bounds.
    fn scale_into_bounds(&self, image: DynamicImage) -> DynamicImage {
        if image.width() <= self.max_width || image.height() <= self.max_height {
            return image;
        }
        let ratio = image.width() as f64 / image.height() as f64;
        let mut scaled_width = (self.max_height as f64 * ratio).ceil() as u32;
        if scaled_width < self.max_width {
            scaled_width = self.max_width;
        }
        let resized = image.resize_exact(scaled_width, self.max_height, FilterType::Lanczos3);
        if scaled_width > self.max_width {
            let left = (scaled_width - self.max_width) / 2;
            resized.crop_imm(left, 0, self.max_width, self.max_height)
        } else {
            resized
        }
    }
}

/// The standard thumbnail URL patterns for a remote key, best first
pub fn thumbnail_candidates(remote_key: &str) -> Vec<String> {
    ["maxres", "sd", "hq"]
        .iter()
        .map(|prefix| format!("https://i.ytimg.com/vi/{remote_key}/{prefix}default.jpg"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_candidates_order() {
        let urls = thumbnail_candidates("abc");
        assert_eq!(
            urls,
            vec![
                "https://i.ytimg.com/vi/abc/maxresdefault.jpg",
                "https://i.ytimg.com/vi/abc/sddefault.jpg",
                "https://i.ytimg.com/vi/abc/hqdefault.jpg",
            ]
        );
    }

    #[test]
    fn test_scale_into_bounds() {
        let service = ThumbnailService::new(430, 240).unwrap();

        // small images pass through untouched
        let small = DynamicImage::new_rgb8(320, 180);
        let scaled = service.scale_into_bounds(small);
        assert_eq!((scaled.width(), scaled.height()), (320, 180));

        // large 16:9 images land exactly on the bounds
        let large = DynamicImage::new_rgb8(1280, 720);
        let scaled = service.scale_into_bounds(large);
        assert_eq!((scaled.width(), scaled.height()), (430, 240));

        // very wide images are cropped to the bounds
        let wide = DynamicImage::new_rgb8(2000, 500);
        let scaled = service.scale_into_bounds(wide);
        assert_eq!((scaled.width(), scaled.height()), (430, 240));
    }
}
