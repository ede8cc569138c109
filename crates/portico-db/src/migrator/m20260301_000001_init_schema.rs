//! Initial schema: domains, verifications, certificates, DNS providers and routes

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DnsProviders::Table)
                    .if_not_exists()
                    .col(string_len(DnsProviders::Id, 36).primary_key())
                    .col(string_len(DnsProviders::Name, 255).not_null().unique_key())
                    .col(string_len(DnsProviders::Kind, 16).not_null())
                    .col(text_null(DnsProviders::EncryptedApiToken))
                    .col(string_len_null(DnsProviders::TokenNonce, 64))
                    .col(boolean(DnsProviders::Active).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(DnsProviders::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(DnsProviders::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Domains::Table)
                    .if_not_exists()
                    .col(string_len(Domains::Id, 36).primary_key())
                    .col(string_len(Domains::Name, 253).not_null().unique_key())
                    .col(
                        string_len(Domains::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(string_len(Domains::VerificationMethod, 8).not_null())
                    .col(string_len_null(Domains::ProviderId, 36))
                    .col(string_len_null(Domains::ZoneId, 255))
                    .col(string_len(Domains::VerificationToken, 128).not_null())
                    .col(timestamp_with_time_zone_null(Domains::VerificationCheckedAt))
                    .col(string_len_null(Domains::CertificateId, 36))
                    .col(boolean(Domains::AutoManage).not_null().default(false))
                    .col(text_null(Domains::ErrorReason))
                    .col(integer(Domains::ConsecutiveFailures).not_null().default(0))
                    .col(timestamp_with_time_zone_null(Domains::NextCheckAt))
                    .col(
                        timestamp_with_time_zone(Domains::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Domains::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DomainVerifications::Table)
                    .if_not_exists()
                    .col(string_len(DomainVerifications::Id, 36).primary_key())
                    .col(
                        string_len(DomainVerifications::DomainId, 36)
                            .not_null()
                            .unique_key(),
                    )
                    .col(string_len(DomainVerifications::Method, 8).not_null())
                    .col(text(DomainVerifications::Challenge).not_null())
                    .col(
                        string_len(DomainVerifications::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(timestamp_with_time_zone_null(
                        DomainVerifications::LastCheckedAt,
                    ))
                    .col(
                        integer(DomainVerifications::Attempts)
                            .not_null()
                            .default(0),
                    )
                    .col(text_null(DomainVerifications::LastError))
                    .col(string_len_null(DomainVerifications::ProviderRecordId, 255))
                    .col(text_null(DomainVerifications::Instructions))
                    .col(
                        timestamp_with_time_zone(DomainVerifications::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Certificates::Table)
                    .if_not_exists()
                    .col(string_len(Certificates::Id, 36).primary_key())
                    .col(string_len(Certificates::DomainId, 36).not_null())
                    .col(string_len(Certificates::Domain, 253).not_null())
                    .col(string_len(Certificates::CertType, 16).not_null())
                    .col(string_len_null(Certificates::Issuer, 512))
                    .col(timestamp_with_time_zone_null(Certificates::NotBefore))
                    .col(timestamp_with_time_zone_null(Certificates::NotAfter))
                    .col(
                        string_len(Certificates::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(text_null(Certificates::PemCert))
                    .col(text_null(Certificates::PemChain))
                    .col(text_null(Certificates::EncryptedKey))
                    .col(string_len_null(Certificates::KeyNonce, 64))
                    .col(boolean(Certificates::AutoRenew).not_null().default(true))
                    .col(string_len_null(Certificates::RenewalOf, 36))
                    .col(integer(Certificates::Attempts).not_null().default(0))
                    .col(text_null(Certificates::LastError))
                    .col(timestamp_with_time_zone_null(Certificates::NextAttemptAt))
                    .col(
                        timestamp_with_time_zone(Certificates::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Certificates::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Routes::Table)
                    .if_not_exists()
                    .col(string_len(Routes::Id, 36).primary_key())
                    .col(string_len(Routes::ServiceId, 255).not_null())
                    .col(string_len_null(Routes::DomainId, 36))
                    .col(string_len(Routes::Path, 1024).not_null().default("/"))
                    .col(integer(Routes::Port).not_null())
                    .col(boolean(Routes::Tls).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(Routes::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Routes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Certificates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DomainVerifications::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Domains::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DnsProviders::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum DnsProviders {
    #[sea_orm(iden = "dns_providers")]
    Table,
    Id,
    Name,
    Kind,
    EncryptedApiToken,
    TokenNonce,
    Active,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Domains {
    Table,
    Id,
    Name,
    Status,
    VerificationMethod,
    ProviderId,
    ZoneId,
    VerificationToken,
    VerificationCheckedAt,
    CertificateId,
    AutoManage,
    ErrorReason,
    ConsecutiveFailures,
    NextCheckAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DomainVerifications {
    #[sea_orm(iden = "domain_verifications")]
    Table,
    Id,
    DomainId,
    Method,
    Challenge,
    Status,
    LastCheckedAt,
    Attempts,
    LastError,
    ProviderRecordId,
    Instructions,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Certificates {
    Table,
    Id,
    DomainId,
    Domain,
    CertType,
    Issuer,
    NotBefore,
    NotAfter,
    Status,
    PemCert,
    PemChain,
    EncryptedKey,
    KeyNonce,
    AutoRenew,
    RenewalOf,
    Attempts,
    LastError,
    NextAttemptAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Routes {
    Table,
    Id,
    ServiceId,
    DomainId,
    Path,
    Port,
    Tls,
    CreatedAt,
}
