//! Target resolution: demo page routing, credential checks and static files.

use crate::conn::{HttpCode, Method};
use crate::mmap::MappedFile;
use crate::store::{Registration, StorePool, UserTable};
use serde::Deserialize;
use std::borrow::Cow;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Form posted by the login and registration pages.
#[derive(Debug, Deserialize)]
struct Credentials {
    user: String,
    password: String,
}

/// A resolved static file. Zero-length files carry no mapping.
#[derive(Debug)]
pub struct StaticFile {
    pub map: Option<MappedFile>,
    pub size: usize,
    pub content_type: &'static str,
}

impl StaticFile {
    pub fn bytes(&self) -> &[u8] {
        self.map.as_ref().map(MappedFile::as_slice).unwrap_or(&[])
    }
}

pub struct Router {
    doc_root: PathBuf,
    default_page: String,
    users: Arc<UserTable>,
    store: Arc<StorePool>,
}

impl Router {
    pub fn new(
        doc_root: impl Into<PathBuf>,
        default_page: impl Into<String>,
        users: Arc<UserTable>,
        store: Arc<StorePool>,
    ) -> Self {
        Self {
            doc_root: doc_root.into(),
            default_page: default_page.into(),
            users,
            store,
        }
    }

    pub fn default_page(&self) -> &str {
        &self.default_page
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    /// Rewrite `target` according to the demo pages. The selector is the
    /// first character after the last `/`:
    ///
    /// | selector | method | result |
    /// |---|---|---|
    /// | `0` | any | `/register.html` |
    /// | `1` | any | `/log.html` |
    /// | `2` | POST | `/welcome.html` or `/logError.html` |
    /// | `3` | POST | `/log.html` or `/registerError.html` |
    /// | `5` | any | `/picture.html` |
    /// | `6` | any | `/video.html` |
    /// | `7` | any | `/fans.html` |
    ///
    /// Anything else is served as-is.
    pub fn route<'a>(&self, method: Method, target: &'a str, body: &[u8]) -> Cow<'a, str> {
        let selector = target
            .rfind('/')
            .and_then(|p| target[p + 1..].chars().next());

        let routed = match (selector, method) {
            (Some('0'), _) => "/register.html",
            (Some('1'), _) => "/log.html",
            (Some('2'), Method::Post) => self.login(body),
            (Some('3'), Method::Post) => self.register(body),
            (Some('5'), _) => "/picture.html",
            (Some('6'), _) => "/video.html",
            (Some('7'), _) => "/fans.html",
            _ => return Cow::Borrowed(target),
        };
        debug!(from = target, to = routed, "target rewritten");
        Cow::Owned(routed.to_string())
    }

    fn login(&self, body: &[u8]) -> &'static str {
        match serde_urlencoded::from_bytes::<Credentials>(body) {
            Ok(form) if self.users.verify(&form.user, &form.password) => {
                info!(user = %form.user, "login accepted");
                "/welcome.html"
            }
            Ok(form) => {
                info!(user = %form.user, "login rejected");
                "/logError.html"
            }
            Err(e) => {
                debug!(error = %e, "malformed login form");
                "/logError.html"
            }
        }
    }

    fn register(&self, body: &[u8]) -> &'static str {
        let form = match serde_urlencoded::from_bytes::<Credentials>(body) {
            Ok(form) => form,
            Err(e) => {
                debug!(error = %e, "malformed registration form");
                return "/registerError.html";
            }
        };
        match self.users.register(&self.store, &form.user, &form.password) {
            Registration::Created => {
                info!(user = %form.user, "user registered");
                "/log.html"
            }
            Registration::Taken | Registration::Failed => "/registerError.html",
        }
    }

    /// Resolve `target` under the document root into `real_file` and map it.
    ///
    /// Missing paths are `NoResource`, files without the world-read bit are
    /// `Forbidden`, and directories or `..` segments are `BadRequest`.
    pub fn resolve(&self, target: &str, real_file: &mut PathBuf) -> Result<StaticFile, HttpCode> {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        if path.split('/').any(|segment| segment == "..") {
            return Err(HttpCode::BadRequest);
        }

        real_file.clear();
        real_file.push(&self.doc_root);
        real_file.push(path.trim_start_matches('/'));

        let meta = fs::metadata(&*real_file).map_err(|_| HttpCode::NoResource)?;
        if meta.permissions().mode() & 0o004 == 0 {
            return Err(HttpCode::Forbidden);
        }
        if meta.is_dir() {
            return Err(HttpCode::BadRequest);
        }

        let size = meta.len() as usize;
        let map = if size == 0 {
            None
        } else {
            let map = MappedFile::open(real_file.as_path(), size).map_err(|e| {
                warn!(path = %real_file.display(), error = %e, "mmap failed");
                HttpCode::InternalError
            })?;
            Some(map)
        };
        let content_type = mime_guess::from_path(&*real_file)
            .first_raw()
            .unwrap_or("application/octet-stream");

        Ok(StaticFile {
            map,
            size,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::path::Path;

    fn router(root: &Path) -> Router {
        let store = MemoryStore::with_users([("alice", "secret")]);
        let pool = Arc::new(StorePool::connect(&store, 2).unwrap());
        let users = Arc::new(UserTable::load(&pool).unwrap());
        Router::new(root, "judge.html", users, pool)
    }

    #[test]
    fn numeric_selectors_rewrite_target() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        assert_eq!(router.route(Method::Get, "/0", b""), "/register.html");
        assert_eq!(router.route(Method::Get, "/1", b""), "/log.html");
        assert_eq!(router.route(Method::Get, "/x/5", b""), "/picture.html");
        assert_eq!(router.route(Method::Get, "/6", b""), "/video.html");
        assert_eq!(router.route(Method::Get, "/7", b""), "/fans.html");
        assert_eq!(router.route(Method::Get, "/index.html", b""), "/index.html");
        // Credential selectors only apply to POST.
        assert_eq!(router.route(Method::Get, "/2CGISQL.cgi", b""), "/2CGISQL.cgi");
    }

    #[test]
    fn login_and_registration_flows() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());

        let ok = router.route(Method::Post, "/2CGISQL.cgi", b"user=alice&password=secret");
        assert_eq!(ok, "/welcome.html");
        let bad = router.route(Method::Post, "/2CGISQL.cgi", b"user=alice&password=nope");
        assert_eq!(bad, "/logError.html");
        let garbage = router.route(Method::Post, "/2CGISQL.cgi", b"\xff");
        assert_eq!(garbage, "/logError.html");

        let created = router.route(Method::Post, "/3CGISQL.cgi", b"user=bob&password=pw");
        assert_eq!(created, "/log.html");
        let taken = router.route(Method::Post, "/3CGISQL.cgi", b"user=bob&password=pw");
        assert_eq!(taken, "/registerError.html");
        assert!(router.users().verify("bob", "pw"));
    }

    #[test]
    fn resolve_classifies_targets() {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in [("index.html", "<p>hi</p>"), ("empty.html", "")] {
            fs::write(dir.path().join(name), contents).unwrap();
            fs::set_permissions(dir.path().join(name), fs::Permissions::from_mode(0o644)).unwrap();
        }
        fs::write(dir.path().join("secret.txt"), "x").unwrap();
        fs::set_permissions(dir.path().join("secret.txt"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::set_permissions(dir.path().join("sub"), fs::Permissions::from_mode(0o755)).unwrap();

        let router = router(dir.path());
        let mut real = PathBuf::new();

        let file = router.resolve("/index.html", &mut real).unwrap();
        assert_eq!(file.size, 9);
        assert_eq!(file.bytes(), b"<p>hi</p>");
        assert_eq!(file.content_type, "text/html");
        assert_eq!(real, dir.path().join("index.html"));

        let empty = router.resolve("/empty.html", &mut real).unwrap();
        assert_eq!(empty.size, 0);
        assert!(empty.map.is_none());

        assert_eq!(router.resolve("/missing.html", &mut real).unwrap_err(), HttpCode::NoResource);
        assert_eq!(router.resolve("/secret.txt", &mut real).unwrap_err(), HttpCode::Forbidden);
        assert_eq!(router.resolve("/sub", &mut real).unwrap_err(), HttpCode::BadRequest);
        assert_eq!(router.resolve("/../etc/passwd", &mut real).unwrap_err(), HttpCode::BadRequest);
    }
}
