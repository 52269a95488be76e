use bitflags::bitflags;
use url::Url;

use crate::config::CacheMode;

bitflags! {
    /// Flags controlling how a single request interacts with the cache.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct LoadFlags: u32 {
        /// Neither read from nor write to the cache.
        const DISABLE_CACHE = 1 << 0;
        /// Do not read from the cache, but store the response.
        const BYPASS_CACHE = 1 << 1;
        /// Only serve the request from the cache; a miss is an error.
        const ONLY_FROM_CACHE = 1 << 2;
        /// Revalidate a cached response before using it.
        const VALIDATE_CACHE = 1 << 3;
        /// Use a cached response even if it is stale.
        const PREFERRING_CACHE = 1 << 4;
    }
}

/// A request header `name` with an optional `value` that triggers it.
///
/// Without a value, the mere presence of the header matches.
struct HeaderMatch {
    name: &'static str,
    value: Option<&'static str>,
}

/// Conditional headers we cannot handle correctly, as they cause unexpected 412s.
const PASS_THROUGH_HEADERS: &[HeaderMatch] = &[
    HeaderMatch {
        name: "if-unmodified-since",
        value: None,
    },
    HeaderMatch {
        name: "if-match",
        value: None,
    },
    HeaderMatch {
        name: "if-range",
        value: None,
    },
];

const FORCE_FETCH_HEADERS: &[HeaderMatch] = &[
    HeaderMatch {
        name: "cache-control",
        value: Some("no-cache"),
    },
    HeaderMatch {
        name: "pragma",
        value: Some("no-cache"),
    },
];

const FORCE_VALIDATE_HEADERS: &[HeaderMatch] = &[HeaderMatch {
    name: "cache-control",
    value: Some("max-age=0"),
}];

/// Headers implying load flags, strongest first.
///
/// A header contributes the flag of the first class it matches.
const SPECIAL_HEADERS: &[(&[HeaderMatch], LoadFlags)] = &[
    (PASS_THROUGH_HEADERS, LoadFlags::DISABLE_CACHE),
    (FORCE_FETCH_HEADERS, LoadFlags::BYPASS_CACHE),
    (FORCE_VALIDATE_HEADERS, LoadFlags::VALIDATE_CACHE),
];

/// Request headers which make a request an external validation of a cached response.
const VALIDATION_HEADERS: &[&str] = &["if-modified-since", "if-none-match"];

fn header_matches(name: &str, value: &str, search: &[HeaderMatch]) -> bool {
    search.iter().any(|candidate| {
        if !name.eq_ignore_ascii_case(candidate.name) {
            return false;
        }
        match candidate.value {
            None => true,
            Some(expected) => value
                .split(',')
                .any(|v| v.trim().eq_ignore_ascii_case(expected)),
        }
    })
}

/// The parts of a request the cache cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// The request method, like `GET`.
    pub method: String,
    /// The requested URL.
    pub url: Url,
    /// The request headers, in the order they were given.
    pub headers: Vec<(String, String)>,
    /// Flags set by the caller.
    pub load_flags: LoadFlags,
    /// Identifies the request body, if any.
    ///
    /// `POST` requests are only cached when their body is identified.
    pub upload_id: Option<u64>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            method: method.into(),
            url,
            headers: Vec::new(),
            load_flags: LoadFlags::empty(),
            upload_id: None,
        }
    }

    /// Creates a plain `GET` request for `url`.
    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_load_flags(mut self, load_flags: LoadFlags) -> Self {
        self.load_flags |= load_flags;
        self
    }

    pub fn with_upload_id(mut self, upload_id: u64) -> Self {
        self.upload_id = Some(upload_id);
        self
    }

    /// Returns the value of the first header called `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Computes the load flags in effect for this request when handled by a cache in `mode`.
    pub fn effective_load(&self, mode: CacheMode) -> EffectiveLoad {
        let mut load_flags = self.load_flags;
        match mode {
            CacheMode::Normal => {}
            // Record mode never loads from the cache, so we do not replay stored responses
            // (including their `Set-Cookie` headers) prematurely.
            CacheMode::Record => load_flags |= LoadFlags::BYPASS_CACHE,
            CacheMode::Playback => load_flags |= LoadFlags::ONLY_FROM_CACHE,
            CacheMode::Disable => load_flags |= LoadFlags::DISABLE_CACHE,
        }

        let mut validation_values: [Option<&str>; 2] = [None, None];
        let mut externally_conditionalized = false;
        let mut validation_error = false;

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("range") {
                // byte ranges are not cached
                load_flags |= LoadFlags::DISABLE_CACHE;
                continue;
            }

            if let Some((_, flag)) = SPECIAL_HEADERS
                .iter()
                .find(|(search, _)| header_matches(name, value, search))
            {
                load_flags |= *flag;
            }

            if let Some(i) = VALIDATION_HEADERS
                .iter()
                .position(|h| name.eq_ignore_ascii_case(h))
            {
                let value = value.trim();
                if validation_values[i].is_some() || value.is_empty() {
                    validation_error = true;
                }
                validation_values[i] = Some(value);
                externally_conditionalized = true;
            }
        }

        // With more than one validation header we do not know for sure which one the server
        // will answer, so this cannot be treated as a validation of our cached copy.
        if validation_error {
            tracing::warn!("Multiple or malformed validation headers found");
            load_flags |= LoadFlags::DISABLE_CACHE;
        }

        EffectiveLoad {
            load_flags,
            externally_conditionalized,
        }
    }
}

/// How a request is going to use the cache, as derived by [`RequestInfo::effective_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLoad {
    /// The request's own load flags combined with those implied by the cache mode and headers.
    pub load_flags: LoadFlags,
    /// Whether the caller validates a response itself (`if-modified-since` / `if-none-match`).
    pub externally_conditionalized: bool,
}
