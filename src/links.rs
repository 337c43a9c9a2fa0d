use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Link {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct LinkDb {
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Error)]
pub enum LinkStoreError {
    #[error("ошибка ввода-вывода {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("повреждён файл ссылок {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("поле url не должно быть пустым")]
    EmptyUrl,
}

pub struct LinkStore {
    path: PathBuf,
    links: Mutex<Vec<Link>>,
}

impl LinkStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LinkStoreError> {
        let path = path.into();
        let links = match fs::read_to_string(&path).await {
            Ok(text) => {
                let db: LinkDb =
                    serde_json::from_str(&text).map_err(|source| LinkStoreError::Json {
                        path: path.display().to_string(),
                        source,
                    })?;
                db.links
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "файл ссылок не найден, создаётся пустой");
                persist(&path, &[]).await?;
                Vec::new()
            }
            Err(source) => {
                return Err(LinkStoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        Ok(Self {
            path,
            links: Mutex::new(links),
        })
    }

    pub async fn list(&self) -> Vec<Link> {
        self.links.lock().await.clone()
    }

    pub async fn upsert(&self, link: Link) -> Result<(), LinkStoreError> {
        if link.url.trim().is_empty() {
            return Err(LinkStoreError::EmptyUrl);
        }
        let mut links = self.links.lock().await;
        let mut next = links.clone();
        match next.iter_mut().find(|l| l.url == link.url) {
            Some(existing) => *existing = link,
            None => next.push(link),
        }
        persist(&self.path, &next).await?;
        *links = next;
        Ok(())
    }

    pub async fn delete(&self, url: &str) -> Result<bool, LinkStoreError> {
        let mut links = self.links.lock().await;
        let next: Vec<Link> = links.iter().filter(|l| l.url != url).cloned().collect();
        if next.len() == links.len() {
            return Ok(false);
        }
        persist(&self.path, &next).await?;
        *links = next;
        Ok(true)
    }
}

/// Writes through a sibling temp file, then renames it over `path`.
async fn persist(path: &Path, links: &[Link]) -> Result<(), LinkStoreError> {
    let db = LinkDb {
        links: links.to_vec(),
    };
    let body = serde_json::to_vec_pretty(&db).map_err(|source| LinkStoreError::Json {
        path: path.display().to_string(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body)
        .await
        .map_err(|source| LinkStoreError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| LinkStoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}
