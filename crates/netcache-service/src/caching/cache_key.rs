use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The identity of a cacheable resource.
///
/// Two requests for the same logical resource produce equal keys. Equality and hashing only
/// consider the SHA-256 hash of the human-readable [`metadata`](Self::metadata), which also
/// determines the stable on-disk location of the entry.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metadata)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKeyBuilder`] for a request with the given method and URL.
    ///
    /// The method is uppercased and the fragment of the URL is dropped, as neither changes the
    /// resource being requested.
    pub fn builder(method: &str, url: &Url) -> CacheKeyBuilder {
        let mut url = url.clone();
        url.set_fragment(None);

        CacheKeyBuilder {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            upload_id: None,
            headers: Vec::new(),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    #[cfg(any(test, feature = "test"))]
    pub fn for_testing(key: impl Into<String>) -> Self {
        Self::from_metadata(key.into())
    }

    fn from_metadata(metadata: String) -> Self {
        // FIXME: `sha2` should really adopt const generics, this is such a pain right now
        let mut hash = [0; 32];
        hash.copy_from_slice(&Sha256::digest(&metadata));

        CacheKey {
            metadata: metadata.into(),
            hash,
        }
    }
}

/// A builder for [`CacheKey`]s.
///
/// The builder canonicalizes its input so that the resulting metadata is **stable** for a given
/// logical resource, which is what makes persisted entries reusable across restarts.
pub struct CacheKeyBuilder {
    method: String,
    url: String,
    upload_id: Option<u64>,
    headers: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    /// Adds the identifier of the request body to the key.
    ///
    /// Only requests with an identified body (like a form `POST`) can be cached, and the body
    /// identifier tells different submissions to the same URL apart.
    pub fn upload_id(mut self, upload_id: u64) -> Self {
        self.upload_id = Some(upload_id);
        self
    }

    /// Adds a request header to the key.
    ///
    /// Header names are compared case-insensitively and surrounding whitespace of the value is
    /// ignored. The order in which headers are added does not matter.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(mut self) -> CacheKey {
        let mut metadata = format!("{}:", self.method);
        if let Some(upload_id) = self.upload_id {
            let _ = write!(metadata, "{upload_id}/");
        }
        metadata.push_str(&self.url);

        self.headers.sort();
        for (name, value) in &self.headers {
            let _ = write!(metadata, "\n{name}: {value}");
        }

        CacheKey::from_metadata(metadata)
    }
}
