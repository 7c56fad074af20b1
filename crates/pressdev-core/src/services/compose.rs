//! The docker-compose document for the local site.

use crate::error::Result;
use crate::io::atomic_write;
use crate::paths::Paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const WEB_SERVICE: &str = "wordpress-develop";
pub const PHP_SERVICE: &str = "php";
pub const CLI_SERVICE: &str = "cli";
pub const DB_SERVICE: &str = "mysql";
pub const TEST_SERVICE: &str = "phpunit";

pub const DB_NAME: &str = "wordpress_develop";
pub const DB_USER: &str = "root";
pub const DB_PASSWORD: &str = "password";
const DB_VOLUME: &str = "mysql";

/// nginx vhost mounted into the web container.
pub const SITE_CONF: &str = r#"server {
    listen 80 default_server;
    server_name localhost;

    root /var/www/build;
    index index.php index.html;

    client_max_body_size 64m;

    location / {
        try_files $uri $uri/ /index.php?$args;
    }

    location ~ \.php$ {
        try_files $uri =404;
        fastcgi_split_path_info ^(.+\.php)(/.+)$;
        fastcgi_pass php:9000;
        fastcgi_index index.php;
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_param PATH_INFO $fastcgi_path_info;
    }
}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeFile {
    pub version: String,
    pub services: BTreeMap<String, Service>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: String,
    pub retries: u32,
}

fn service(image: &str, volumes: Vec<String>) -> Service {
    Service {
        image: image.to_string(),
        volumes,
        ..Service::default()
    }
}

/// Build the stack definition for a checkout at `folder` served on `port`.
pub fn render(folder: &Path, port: u16) -> ComposeFile {
    let folder = folder.to_string_lossy();
    let source = format!("{folder}:/var/www");

    let mut services = BTreeMap::new();
    services.insert(
        WEB_SERVICE.to_string(),
        Service {
            ports: vec![format!("{port}:80")],
            links: vec![PHP_SERVICE.to_string()],
            ..service(
                "nginx:alpine",
                vec![
                    "./site.conf:/etc/nginx/conf.d/default.conf".to_string(),
                    source.clone(),
                ],
            )
        },
    );
    services.insert(
        PHP_SERVICE.to_string(),
        Service {
            links: vec![DB_SERVICE.to_string()],
            ..service("garypendergast/wordpress-develop-php", vec![source.clone()])
        },
    );
    services.insert(
        CLI_SERVICE.to_string(),
        service("wordpress:cli", vec![source]),
    );
    services.insert(
        DB_SERVICE.to_string(),
        Service {
            environment: BTreeMap::from([
                ("MYSQL_ROOT_PASSWORD".to_string(), DB_PASSWORD.to_string()),
                ("MYSQL_DATABASE".to_string(), DB_NAME.to_string()),
            ]),
            healthcheck: Some(HealthCheck {
                test: [
                    "CMD",
                    "mysql",
                    "-e",
                    "SHOW TABLES FROM wordpress_develop",
                    "-uroot",
                    "-ppassword",
                    "-hmysql",
                    "--protocol=tcp",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                interval: "1s".to_string(),
                retries: 100,
            }),
            ..service("mysql:5.7", vec![format!("{DB_VOLUME}:/var/lib/mysql")])
        },
    );
    services.insert(
        TEST_SERVICE.to_string(),
        service(
            "garypendergast/wordpress-develop-phpunit",
            vec![format!("{folder}:/wordpress-develop")],
        ),
    );

    ComposeFile {
        version: "3".to_string(),
        services,
        volumes: BTreeMap::from([(DB_VOLUME.to_string(), BTreeMap::new())]),
    }
}

impl ComposeFile {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Every `host:container` port mapping in the document.
    pub fn port_bindings(&self) -> Vec<&str> {
        self.services
            .values()
            .flat_map(|s| s.ports.iter().map(String::as_str))
            .collect()
    }

    /// Host side of every bind mount (named volumes excluded).
    pub fn mount_sources(&self) -> Vec<&str> {
        self.services
            .values()
            .flat_map(|s| s.volumes.iter())
            .filter_map(|v| v.rsplit_once(':').map(|(src, _)| src))
            .filter(|src| !self.volumes.contains_key(*src))
            .collect()
    }

    /// Write the document and the nginx config next to it.
    pub fn write(&self, paths: &Paths) -> Result<()> {
        atomic_write(&paths.compose_file(), self.to_yaml()?.as_bytes())?;
        atomic_write(&paths.site_conf(), SITE_CONF.as_bytes())?;
        Ok(())
    }
}
