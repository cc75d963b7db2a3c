use bollard::query_parameters::CreateImageOptions;
use futures::StreamExt;
use tracing::debug;

use zane_common::service::RegistryCredentials;

use super::service::docker_credentials;
use super::SwarmClient;
use crate::error::Result;

impl SwarmClient {
    /// Pull an image, streaming progress to completion. Credentials are
    /// forwarded for private registries.
    pub async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        let (repository, tag) = split_image_tag(image);
        let options = Some(CreateImageOptions {
            from_image: Some(repository.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });

        let mut stream =
            self.docker
                .create_image(options, None, credentials.map(docker_credentials));
        while let Some(progress) = stream.next().await {
            let info = progress?;
            debug!(image, status = ?info.status, "image pull progress");
        }
        Ok(())
    }
}

/// Split `redis:alpine` into repository and tag; a bare repository pulls
/// `latest`. A colon inside the registry host (`host:5000/app`) is not a
/// tag separator.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::split_image_tag;

    #[test]
    fn image_references_split_into_repository_and_tag() {
        assert_eq!(split_image_tag("redis:alpine"), ("redis", "alpine"));
        assert_eq!(split_image_tag("redis"), ("redis", "latest"));
        assert_eq!(split_image_tag("ghcr.io/acme/app:v2"), ("ghcr.io/acme/app", "v2"));
        assert_eq!(
            split_image_tag("registry.local:5000/app"),
            ("registry.local:5000/app", "latest")
        );
    }
}
