use crate::Result;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://speed.cloudflare.com";

const DOWNLOAD_PATH: &str = "__down";
const UPLOAD_PATH: &str = "__up";
const METADATA_PATH: &str = "meta";

/// Builds the endpoint urls for one measurement session.
#[derive(Debug, Clone)]
pub struct UrlProvider {
    base: Url,
}

impl UrlProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    pub fn download_url(&self, test_id: u64, payload_size_bytes: u64) -> Result<Url> {
        let mut url = self.base.join(DOWNLOAD_PATH)?;
        url.query_pairs_mut()
            .append_pair("measId", &test_id.to_string())
            .append_pair("bytes", &payload_size_bytes.to_string());
        Ok(url)
    }

    pub fn upload_url(&self, test_id: u64) -> Result<Url> {
        let mut url = self.base.join(UPLOAD_PATH)?;
        url.query_pairs_mut()
            .append_pair("measId", &test_id.to_string());
        Ok(url)
    }

    pub fn metadata_url(&self) -> Result<Url> {
        Ok(self.base.join(METADATA_PATH)?)
    }
}

impl Default for UrlProvider {
    fn default() -> Self {
        Self {
            base: Url::parse(DEFAULT_BASE_URL).expect("default base url is valid"),
        }
    }
}

/// Random non-negative measurement id shared by every probe of a session.
pub fn new_test_id() -> u64 {
    rand::random::<u64>() >> 1
}
