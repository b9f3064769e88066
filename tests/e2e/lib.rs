#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use gitops_reverser::crd::{
        EncryptionConfig, GitProvider, GitProviderSpec, GitTarget, GitTargetSpec,
        ProviderReference, SecretReference,
    };
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;

    /// Credentials and repo URL for the scratch Git remote the e2e harness
    /// stands up alongside the cluster; not provisioned by this crate.
    const TEST_REPO_URL: &str = "http://gitea.gitops-reverser-e2e.svc/root/scratch.git";
    const TEST_NAMESPACE: &str = "gitops-reverser-e2e";

    fn is_condition_true(type_: &'static str) -> impl Condition<GitTarget> {
        move |obj: Option<&GitTarget>| {
            obj.and_then(|t| t.status.as_ref())
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|cs| cs.iter().any(|c| c.type_ == type_ && c.status == "True"))
        }
    }

    fn is_provider_validated() -> impl Condition<GitProvider> {
        |obj: Option<&GitProvider>| {
            obj.and_then(|p| p.status.as_ref())
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Validated" && c.status == "True"))
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(60),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn ensure_credentials_secret(client: Client, name: &str) -> Api<Secret> {
        let secrets = Api::<Secret>::namespaced(client, TEST_NAMESPACE);
        let mut string_data = BTreeMap::new();
        string_data.insert("username".to_string(), "gitops-reverser-e2e".to_string());
        string_data.insert("password".to_string(), "scratch-token".to_string());
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                ..Default::default()
            },
            string_data: Some(string_data),
            ..Default::default()
        };
        secrets
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&secret),
            )
            .await
            .unwrap();
        secrets
    }

    async fn setup(name: &str) -> (Api<GitProvider>, Api<GitTarget>) {
        let client = Client::try_default().await.unwrap();
        ensure_credentials_secret(client.clone(), &format!("{name}-creds")).await;

        let provider_api = Api::<GitProvider>::namespaced(client.clone(), TEST_NAMESPACE);
        let provider = GitProvider::new(
            name,
            GitProviderSpec {
                repo_url: TEST_REPO_URL.to_string(),
                allowed_branches: None,
                secret_ref: SecretReference {
                    name: format!("{name}-creds"),
                    namespace: None,
                },
            },
        );
        provider_api
            .create(&PostParams::default(), &provider)
            .await
            .unwrap();
        wait_for(provider_api.clone(), name, is_provider_validated()).await;

        let target_api = Api::<GitTarget>::namespaced(client, TEST_NAMESPACE);
        let target = GitTarget::new(
            name,
            GitTargetSpec {
                provider_ref: ProviderReference {
                    name: name.to_string(),
                    namespace: None,
                },
                path: format!("apps/{name}"),
                branch: "main".to_string(),
                encryption: None,
            },
        );
        target_api
            .create(&PostParams::default(), &target)
            .await
            .unwrap();
        wait_for(target_api.clone(), name, is_condition_true("Ready")).await;

        (provider_api, target_api)
    }

    #[tokio::test]
    async fn git_target_becomes_ready_after_bootstrap() {
        let name = "test-bootstrap";
        setup(name).await;
    }

    #[tokio::test]
    async fn git_target_rejects_disallowed_branch() {
        let name = "test-branch-denied";
        let client = Client::try_default().await.unwrap();
        ensure_credentials_secret(client.clone(), &format!("{name}-creds")).await;

        let provider_api = Api::<GitProvider>::namespaced(client.clone(), TEST_NAMESPACE);
        let provider = GitProvider::new(
            name,
            GitProviderSpec {
                repo_url: TEST_REPO_URL.to_string(),
                allowed_branches: Some(vec!["main".to_string()]),
                secret_ref: SecretReference {
                    name: format!("{name}-creds"),
                    namespace: None,
                },
            },
        );
        provider_api
            .create(&PostParams::default(), &provider)
            .await
            .unwrap();
        wait_for(provider_api.clone(), name, is_provider_validated()).await;

        let target_api = Api::<GitTarget>::namespaced(client, TEST_NAMESPACE);
        let target = GitTarget::new(
            name,
            GitTargetSpec {
                provider_ref: ProviderReference {
                    name: name.to_string(),
                    namespace: None,
                },
                path: "apps/denied".to_string(),
                branch: "experimental".to_string(),
                encryption: None,
            },
        );
        target_api
            .create(&PostParams::default(), &target)
            .await
            .unwrap();

        let not_ready = |obj: Option<&GitTarget>| -> bool {
            obj.and_then(|t| t.status.as_ref())
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|cs| {
                    cs.iter().any(|c| {
                        c.type_ == "Validated" && c.status == "False" && c.reason == "InvalidReference"
                    })
                })
        };
        wait_for(target_api, name, not_ready).await;
    }

    #[tokio::test]
    async fn git_target_delete_removes_finalizer() {
        let name = "test-delete-target";
        let (_, target_api) = setup(name).await;

        let target = target_api.get(name).await.unwrap();
        target_api.delete(name, &Default::default()).await.unwrap();

        wait_for(
            target_api,
            name,
            conditions::is_deleted(&target.uid().unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn encryption_config_blocks_on_missing_secret() {
        let name = "test-missing-sops-key";
        let client = Client::try_default().await.unwrap();
        ensure_credentials_secret(client.clone(), &format!("{name}-creds")).await;

        let provider_api = Api::<GitProvider>::namespaced(client.clone(), TEST_NAMESPACE);
        let provider = GitProvider::new(
            name,
            GitProviderSpec {
                repo_url: TEST_REPO_URL.to_string(),
                allowed_branches: None,
                secret_ref: SecretReference {
                    name: format!("{name}-creds"),
                    namespace: None,
                },
            },
        );
        provider_api
            .create(&PostParams::default(), &provider)
            .await
            .unwrap();
        wait_for(provider_api, name, is_provider_validated()).await;

        let target_api = Api::<GitTarget>::namespaced(client, TEST_NAMESPACE);
        let target = GitTarget::new(
            name,
            GitTargetSpec {
                provider_ref: ProviderReference {
                    name: name.to_string(),
                    namespace: None,
                },
                path: "apps/secrets-only".to_string(),
                branch: "main".to_string(),
                encryption: Some(EncryptionConfig {
                    provider: "sops".to_string(),
                    secret_ref: SecretReference {
                        name: "does-not-exist".to_string(),
                        namespace: None,
                    },
                    generate_when_missing: false,
                }),
            },
        );
        target_api
            .create(&PostParams::default(), &target)
            .await
            .unwrap();

        let blocked_on_missing_key = |obj: Option<&GitTarget>| -> bool {
            obj.and_then(|t| t.status.as_ref())
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|cs| {
                    cs.iter().any(|c| {
                        c.type_ == "EncryptionConfigured"
                            && c.status == "False"
                            && c.reason == "ConfigurationError"
                    })
                })
        };
        wait_for(target_api, name, blocked_on_missing_key).await;
    }
}
