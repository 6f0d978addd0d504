mod fetcher;

pub use fetcher::{
    resolve_url, BundleFetcher, Credentials, FetchError, FetchFuture, FetchRequest, HttpFetcher,
    StaticFetcher,
};
